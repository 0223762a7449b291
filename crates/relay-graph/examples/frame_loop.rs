//! Minimal headless frame loop against the recording backend: a three-pass
//! deferred-style graph across two worker threads, run for a handful of
//! frames with the swapchain image rebound every frame.
//!
//! Run with `cargo run --example frame_loop` and RUST_LOG-style verbosity via
//! `SimpleLogger`'s level below.

use relay_graph::{Compiler, FrameGraph, PassContext, RelayError};
use relay_graph::hal::{
    Format, HeapKind, ResourceDesc, ResourceState, ViewDesc, null::NullBackend,
};

fn main() -> Result<(), RelayError> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Trace)
        .init()
        .unwrap();

    let backend = NullBackend::new(2);
    let ctx = backend.context();

    let mut graph = FrameGraph::new();
    let gbuffer = graph.add_internal_resource(
        "gbuffer",
        ResourceDesc::Texture2d {
            width: 1920,
            height: 1080,
            format: Format::Rgba16Float,
            mip_levels: 1,
        },
        ResourceState::Undefined,
        None,
        HeapKind::Default,
    );
    let swapchain = graph.add_external_resource(
        "swapchain",
        ResourceDesc::Texture2d {
            width: 1920,
            height: 1080,
            format: Format::Bgra8Unorm,
            mip_levels: 1,
        },
        ResourceState::Present,
        ResourceState::Present,
    );

    let geometry = graph.add_pass(
        "geometry",
        0,
        0,
        Box::new(|_ctx: &mut PassContext| Ok(())),
    );
    let shade = graph.add_pass(
        "shade",
        1,
        1,
        Box::new(move |ctx: &mut PassContext| {
            let _input = ctx.descriptor(gbuffer, ViewDesc::ShaderRead)?;
            Ok(())
        }),
    );
    let present = graph.add_pass(
        "present",
        0,
        0,
        Box::new(|_ctx: &mut PassContext| Ok(())),
    );

    graph.pass_use(geometry, gbuffer, ResourceState::RenderTarget, None)?;
    graph.pass_use(
        shade,
        gbuffer,
        ResourceState::ShaderResource,
        Some(ViewDesc::ShaderRead),
    )?;
    graph.pass_use(present, swapchain, ResourceState::RenderTarget, None)?;
    graph.add_dependency(geometry, shade)?;
    graph.add_dependency(shade, present)?;

    let mut runtime = Compiler::new()
        .with_threads(2)
        .with_queues(2)
        .with_frames_in_flight(2)
        .compile(graph, &ctx)?;
    log::info!("schedule: {}", runtime.stats());

    for frame in 0..4u64 {
        //a real swapchain hands out a different image every frame
        runtime.set_external_resource(swapchain, None, backend.external_texture(1920, 1080))?;
        runtime.run(frame)?;
    }

    for (index, queue) in backend.queues.iter().enumerate() {
        log::info!("queue {index} saw {} operations", queue.log().len());
    }
    Ok(())
}

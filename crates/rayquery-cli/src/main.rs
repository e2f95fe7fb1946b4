use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rayquery::{
    create_configurations,
    primitives::PrimitiveKind,
    scene::test_scenes,
    DeviceEnumerator, EngineSettings, HostEnumerator, Mode, MultiDeviceCoordinator, PreparedScene, World,
};

#[derive(Debug, clap::Parser)]
#[command(name = "rayquery", about = "Batch ray intersection on every available compute device")]
struct CommandLineArguments {
    #[arg(long, default_value_t = Mode::AllDevices, help = "Device selection: all-gpus, all-cpus, single-gpu, single-cpu, all")]
    mode: Mode,
    #[arg(long, help = "Share the primary device's context with the display")]
    interop: bool,
    #[arg(long, value_enum, default_value_t = Backend::Host, help = "Device backend")]
    backend: Backend,

    #[arg(long, default_value = "mixed", help = "Builtin test scene by name")]
    scene: String,
    #[arg(long = "option", value_name = "KEY=VALUE", help = "Engine option, may be repeated")]
    options: Vec<String>,
    #[arg(long, help = "Print reports as JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum Backend {
    #[default]
    Host,
    Opencl,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    #[command(about = "Create the device configurations and list them")]
    Devices,
    #[command(about = "Build the spatial indices for a scene and report their statistics")]
    Build,
    #[command(about = "Trace random rays against a scene on every configured device")]
    Bench {
        #[arg(long, default_value_t = 1_000_000, help = "Number of rays")]
        rays: usize,
        #[arg(long, default_value_t = 0, help = "Seed for the random rays")]
        seed: u64,
        #[arg(long, help = "Any-hit queries instead of closest hit")]
        occlusion: bool,
    },
    #[command(about = "List all builtin test scenes")]
    ListScenes,
}

#[derive(Serialize)]
struct DeviceReport {
    vendor: String,
    device: String,
    device_type: String,
    compute_units: u32,
    role: String,
    context: String,
    can_interop: bool,
}

#[derive(Serialize)]
struct IndexReport {
    kind: String,
    primitives: usize,
    degenerate: usize,
    nodes: usize,
    leaves: usize,
    depth: usize,
    largest_leaf: usize,
}

#[derive(Serialize)]
struct BuildReport {
    scene: String,
    build_ms: f64,
    indices: Vec<IndexReport>,
}

#[derive(Serialize)]
struct BenchReport {
    scene: String,
    devices: Vec<String>,
    rays: usize,
    hits: usize,
    trace_ms: f64,
    mrays_per_second: f64,
}

fn enumerator(backend: Backend) -> anyhow::Result<Box<dyn DeviceEnumerator>> {
    match backend {
        Backend::Host => Ok(Box::new(HostEnumerator::new())),
        #[cfg(feature = "opencl")]
        Backend::Opencl => Ok(Box::new(rayquery::ClEnumerator::new())),
        #[cfg(not(feature = "opencl"))]
        Backend::Opencl => Err(anyhow::anyhow!("rayquery was built without the opencl feature")),
    }
}

fn load_world(name: &str) -> anyhow::Result<World> {
    let descriptor = test_scenes::find_test_scene(name).with_context(|| {
        let names: Vec<&str> = test_scenes::all_test_scenes().iter().map(|s| s.name).collect();
        format!("unknown scene {name}, expected one of {}", names.join(", "))
    })?;
    Ok((descriptor.world_func)())
}

fn engine_settings(options: &[String]) -> anyhow::Result<EngineSettings> {
    let mut settings = EngineSettings::default();
    for option in options {
        settings
            .apply(option)
            .with_context(|| format!("failed to apply option {option}"))?;
    }
    Ok(settings)
}

fn print_report<T: Serialize>(report: &T, json: bool, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("failed to serialize report")?);
    } else {
        text(report);
    }
    Ok(())
}

fn devices(args: &CommandLineArguments) -> anyhow::Result<()> {
    let enumerator = enumerator(args.backend)?;
    // open every context so a failed interop context shows up as the compute fallback
    let configs = create_configurations(enumerator.as_ref(), args.mode, args.interop, |_, _| Ok(()))
        .with_context(|| format!("failed to create device configurations for mode {}", args.mode))?;

    let reports: Vec<DeviceReport> = configs
        .iter()
        .map(|config| {
            let info = config.device.info();
            DeviceReport {
                vendor: info.vendor.clone(),
                device: info.name.clone(),
                device_type: info.device_type.to_string(),
                compute_units: info.compute_units,
                role: format!("{:?}", config.role).to_lowercase(),
                context: format!("{:?}", config.device.context_kind()).to_lowercase(),
                can_interop: config.can_interop,
            }
        })
        .collect();

    print_report(&reports, args.json, |reports| {
        for r in reports {
            println!(
                "{:<10} {:<24} {:<12} {:>4} CUs  {} ({} context){}",
                r.vendor,
                r.device,
                r.device_type,
                r.compute_units,
                r.role,
                r.context,
                if r.can_interop { " interop" } else { "" }
            );
        }
    })
}

fn build(args: &CommandLineArguments) -> anyhow::Result<()> {
    let world = load_world(&args.scene)?;
    let settings = engine_settings(&args.options)?;

    let start = Instant::now();
    let scene = PreparedScene::prepare(&world, &settings).context("failed to build spatial indices")?;
    let build_ms = start.elapsed().as_secs_f64() * 1000.0;

    let indices = PrimitiveKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let stats = scene.index(kind)?.stats();
            Some(IndexReport {
                kind: kind.to_string(),
                primitives: scene.store().len(kind),
                degenerate: scene.store().degenerate_count(kind),
                nodes: stats.nodes,
                leaves: stats.leaves,
                depth: stats.depth,
                largest_leaf: stats.largest_leaf,
            })
        })
        .collect();

    let report = BuildReport {
        scene: args.scene.clone(),
        build_ms,
        indices,
    };
    print_report(&report, args.json, |report| {
        println!("{}: built in {:.2} ms", report.scene, report.build_ms);
        for index in &report.indices {
            println!(
                "  {:<8} {} primitives ({} degenerate), {} nodes, {} leaves, depth {}, largest leaf {}",
                index.kind,
                index.primitives,
                index.degenerate,
                index.nodes,
                index.leaves,
                index.depth,
                index.largest_leaf
            );
        }
    })
}

fn bench(args: &CommandLineArguments, rays: usize, seed: u64, occlusion: bool) -> anyhow::Result<()> {
    let world = load_world(&args.scene)?;
    let settings = engine_settings(&args.options)?;
    let enumerator = enumerator(args.backend)?;

    let mut coordinator = MultiDeviceCoordinator::new(enumerator.as_ref(), args.mode, args.interop, settings)
        .context("failed to create device configurations")?;
    coordinator.process(&world).context("failed to process scene")?;

    let batch = test_scenes::random_rays(rays, seed);
    info!("tracing {} rays", batch.len());

    let start = Instant::now();
    let hits = if occlusion {
        let records = coordinator.occluded(&batch).context("occlusion query failed")?;
        records.iter().filter(|&&r| rayquery::ray::is_occluded(r)).count()
    } else {
        let hits = coordinator.intersect(&batch).context("intersection query failed")?;
        hits.iter().filter(|h| h.is_hit()).count()
    };
    let elapsed = start.elapsed().as_secs_f64();

    let report = BenchReport {
        scene: args.scene.clone(),
        devices: coordinator
            .configurations()
            .iter()
            .map(|c| c.device.name().to_owned())
            .collect(),
        rays: batch.len(),
        hits,
        trace_ms: elapsed * 1000.0,
        mrays_per_second: batch.len() as f64 / elapsed.max(f64::EPSILON) / 1e6,
    };
    print_report(&report, args.json, |report| {
        println!(
            "{}: {} rays, {} hits in {:.2} ms ({:.2} Mrays/s) on {}",
            report.scene,
            report.rays,
            report.hits,
            report.trace_ms,
            report.mrays_per_second,
            report.devices.join(", ")
        );
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = CommandLineArguments::parse();
    match &args.command {
        Command::Devices => devices(&args),
        Command::Build => build(&args),
        Command::Bench { rays, seed, occlusion } => bench(&args, *rays, *seed, *occlusion),
        Command::ListScenes => {
            let scenes: Vec<&str> = test_scenes::all_test_scenes().iter().map(|s| s.name).collect();
            println!("{}", serde_json::to_string(&scenes)?);
            Ok(())
        }
    }
}

//! tilegemm command-line driver.
//!
//! Inspects tile plans, runs GEMMs on the reference device against the
//! host reference math, and prints or validates engine configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilegemm::reference_kernels::{max_abs_diff, ref_gemm};
use tilegemm::scheduler::BaseOffsets;
use tilegemm::{
    BRead, ComputeDevice, DeviceExt, GemmConfig, GemmContext, GemmGeometry, GemmOutcome,
    GemmRequest, KernelKey, ReferenceDevice, TilePlan, TileShape, Transpose, gemm,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "tilegemm")]
#[command(about = "Tiled, image-staged GEMM engine driver")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Copy)]
struct Shape {
    #[arg(short)]
    m: usize,
    #[arg(short)]
    n: usize,
    #[arg(short)]
    k: usize,
    /// Read A transposed
    #[arg(long)]
    trans_a: bool,
    /// Read B transposed
    #[arg(long)]
    trans_b: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe the reference device and the resolved configuration
    Info,
    /// Print the tile plan and kernel variant of a multiply
    Plan {
        #[command(flatten)]
        shape: Shape,
        /// List every step
        #[arg(long)]
        steps: bool,
    },
    /// Run a multiply on the reference device and check it against the host
    Bench {
        #[command(flatten)]
        shape: Shape,
        #[arg(long, default_value_t = 1.0)]
        alpha: f32,
        #[arg(long, default_value_t = 0.0)]
        beta: f32,
        #[arg(long, default_value_t = 3)]
        iterations: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Override the configured tile shape
        #[arg(long)]
        tile_shape: Option<TileShape>,
    },
    /// Print the default configuration, or validate `--config`
    Config,
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<GemmConfig> {
    let config = match path {
        Some(path) => GemmConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GemmConfig::from_env().context("invalid TILEGEMM_* override")?,
    };
    debug!(?config, "configuration resolved");
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Info => info_cmd(config),
        Commands::Plan { shape, steps } => plan_cmd(&config, shape, steps),
        Commands::Bench {
            shape,
            alpha,
            beta,
            iterations,
            seed,
            tile_shape,
        } => {
            let config = GemmConfig {
                tile_shape: tile_shape.unwrap_or(config.tile_shape),
                ..config
            };
            bench_cmd(config, shape, alpha, beta, iterations, seed)
        }
        Commands::Config => {
            match &cli.config {
                Some(path) => println!("{}: ok", path.display()),
                None => print!("{}", GemmConfig::default_toml()?),
            }
            Ok(())
        }
    }
}

fn info_cmd(config: GemmConfig) -> Result<()> {
    let device = Arc::new(ReferenceDevice::new());
    let ctx = GemmContext::new(device.clone(), config)?;
    let info = device.info();
    println!("device        {} ({})", info.name, info.vendor);
    println!("class         {}", info.class);
    println!("image limit   {}x{}", info.image2d_max_width, info.image2d_max_height);
    println!("subgroups     {}", info.subgroups);
    println!("max tile edge {}", ctx.config().max_tile_edge);
    println!("tile shape    {}", ctx.config().tile_shape);
    println!("tiled layers  {}", ctx.config().enable_tiled_path);
    println!("gemm kernels  {}", ctx.kernels().len());
    Ok(())
}

fn geometry(shape: Shape) -> GemmGeometry {
    GemmGeometry::new(
        Transpose::from(shape.trans_a),
        Transpose::from(shape.trans_b),
        shape.m,
        shape.n,
        shape.k,
    )
}

fn plan_cmd(config: &GemmConfig, shape: Shape, list_steps: bool) -> Result<()> {
    if shape.k == 0 {
        bail!("K must be positive");
    }
    let geometry = geometry(shape);
    let plan = TilePlan::new(geometry, config.max_tile_edge, BaseOffsets::default())?;
    let key = KernelKey {
        shape: config.tile_shape,
        trans_a: geometry.trans_a,
        b_read: BRead::select(geometry.trans_b, false, shape.k),
        alpha_one: true,
        beta_zero: true,
    };
    let (rows, cols, ks) = plan.grid();
    println!("kernel {}", key.program_name());
    println!("grid   {rows} x {cols} x {ks} ({} launches)", plan.len());
    if list_steps {
        for step in plan.steps() {
            println!(
                "#{:<4} C[{}..{}, {}..{}] k {}..{} padded_k {}{}",
                step.index,
                step.c.row,
                step.c.row + step.c.height,
                step.c.col,
                step.c.col + step.c.width,
                step.k_block * plan.tile_edge(),
                step.k_block * plan.tile_edge() + step.block_k,
                step.padded_k,
                if step.first_k_block { " init" } else { "" }
            );
        }
    }
    Ok(())
}

fn bench_cmd(
    config: GemmConfig,
    shape: Shape,
    alpha: f32,
    beta: f32,
    iterations: usize,
    seed: u64,
) -> Result<()> {
    let Shape { m, n, k, .. } = shape;
    let (ta, tb) = (Transpose::from(shape.trans_a), Transpose::from(shape.trans_b));
    let device = Arc::new(ReferenceDevice::new());
    let ctx = GemmContext::new(device.clone(), config)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut random = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect() };
    let a = random(m * k);
    let b = random(k * n);
    let c0 = random(m * n);
    let a_buf = device.upload(&a)?;
    let b_buf = device.upload(&b)?;
    let c_buf = device.upload(&c0)?;

    let mut expected = c0.clone();
    ref_gemm(ta, tb, m, n, k, alpha, &a, &b, beta, &mut expected);

    for iteration in 0..iterations.max(1) {
        device.write_buffer(&c_buf, 0, &c0.iter().map(|v| v.to_bits()).collect::<Vec<_>>())?;
        let request = GemmRequest::new(m, n, k, &a_buf, &b_buf, &c_buf)
            .transpose(ta, tb)
            .scale(alpha, beta);
        let start = Instant::now();
        let summary = match gemm(&ctx, &request)? {
            GemmOutcome::Scheduled(summary) => summary,
            GemmOutcome::Unsupported(reason) => bail!("multiply not supported: {reason}"),
        };
        ctx.quiesce()?;
        let elapsed = start.elapsed();

        let got = device.download::<f32>(&c_buf)?;
        let diff = max_abs_diff(&got, &expected);
        info!(iteration, tiles = summary.tiles, ?elapsed, diff, "bench iteration");
        println!(
            "#{iteration} {} tiles={} staged={} {:.3} ms max_abs_diff={diff:e}",
            summary.kernel.name(),
            summary.tiles,
            summary.staged_images,
            elapsed.as_secs_f64() * 1e3
        );
        if diff > 1e-3 * k.max(1) as f32 {
            bail!("result diverges from host reference by {diff}");
        }
    }

    let counters = ctx.counters().snapshot();
    println!(
        "calls={} tiles={} stage_ops={} live_images={}",
        counters.gemm_calls,
        counters.tiles,
        counters.stage_ops,
        device.stats().live_images
    );
    Ok(())
}

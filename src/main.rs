use image_clicker::adb::{AdbScreen, AdbShell};
use image_clicker::args::{self, Args, Command, Mode};
use image_clicker::automation::{
    AutomationLoop, CycleOutcome, DryRunDispatcher, LoopConfig, StillFrameProvider,
};
use image_clicker::template_matching::{Frame, ReferenceImage, TemplateMatcher};
use std::error::Error;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

fn main() -> ExitCode {
    let args = match Args::parse() {
        Ok(Command::Execute(args)) => args,
        Ok(Command::Help) => {
            args::print_help();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!(
                "Image Clicker v{} (c) {}",
                env!("APP_VERSION_DISPLAY"),
                env!("APP_BUILD_YEAR")
            );
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("❌ {e}");
            args::print_help();
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG overrides the level chosen by --debug
    let level = if args.debug_mode { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.mode.clone() {
        Mode::Run => rt.block_on(run_loop(&args)),
        Mode::Match(image) => run_match(&args, &image),
        Mode::Screenshot => rt.block_on(take_screenshot(&args)),
        Mode::Devices => rt.block_on(list_devices()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_template(args: &Args) -> Result<ReferenceImage, Box<dyn Error + Send + Sync>> {
    let path = args
        .template
        .as_deref()
        .ok_or("--template=<png> is required")?;
    let reference = ReferenceImage::open(path)?;
    log::info!(
        "🖼️ Template {} ({}x{})",
        path.display(),
        reference.width(),
        reference.height()
    );
    Ok(reference)
}

async fn connect(args: &Args) -> Result<AdbShell, Box<dyn Error + Send + Sync>> {
    let shell = match args.device.as_deref() {
        Some(name) => AdbShell::new_with_device(name).await?,
        None => AdbShell::new(None).await?,
    };
    Ok(shell)
}

async fn run_loop(args: &Args) -> CliResult {
    let config = LoopConfig::new(load_template(args)?)
        .with_interval(Duration::from_millis(args.interval_ms))
        .with_threshold(args.threshold);
    config.validate()?;

    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();

    // The device is only needed when it is the frame source or the tap target
    let screen = if args.frames.is_none() || !args.dry_run {
        Some(Arc::new(AdbScreen::new(connect(args).await?)))
    } else {
        None
    };

    match (&args.frames, &screen) {
        (Some(path), _) if args.dry_run => {
            automation.start(config, StillFrameProvider::open(path)?, DryRunDispatcher::new())?
        }
        (Some(path), Some(screen)) => {
            automation.start(config, StillFrameProvider::open(path)?, Arc::clone(screen))?
        }
        (None, Some(screen)) if args.dry_run => {
            automation.start(config, Arc::clone(screen), DryRunDispatcher::new())?
        }
        (None, Some(screen)) => automation.start(config, Arc::clone(screen), Arc::clone(screen))?,
        (_, None) => return Err("no frame source available".into()),
    }

    let shutdown = shutdown_requested(args.debug_mode_timeout_secs.map(Duration::from_secs));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            reason = &mut shutdown => {
                log::info!("{reason}");
                break;
            }
            report = reports.recv() => match report {
                Ok(report) => {
                    if let CycleOutcome::Dispatched { x, y, confidence, .. } = report.outcome {
                        println!("🎯 Cycle {}: tapped ({x:.1}, {y:.1}) at {:.1}%", report.index, confidence * 100.0);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    log::debug!("Skipped {missed} cycle reports");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    automation.stop().await;
    let stats = automation.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!(
        "📊 {} cycles: {} taps ({} cancelled, {} failed), {} misses, {} without frame, {} match errors",
        stats.cycles,
        stats.dispatched,
        stats.dispatch_cancelled,
        stats.dispatch_failures,
        stats.misses,
        stats.frames_unavailable,
        stats.match_failures
    );
    Ok(())
}

/// Resolves on Ctrl-C, or once `deadline` has passed when one is given.
async fn shutdown_requested(deadline: Option<Duration>) -> &'static str {
    let timeout = async {
        match deadline {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Ctrl-C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => "🛑 Ctrl-C received",
        _ = timeout => "⏰ Timeout reached",
    }
}

fn run_match(args: &Args, image: &Path) -> CliResult {
    let reference = load_template(args)?;
    let frame = Frame::open(image)?;
    let result = TemplateMatcher::new().match_template(&frame, &reference, args.threshold)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.found {
        println!("✅ {result}");
    } else {
        println!("👀 {result}");
    }
    Ok(())
}

async fn take_screenshot(args: &Args) -> CliResult {
    let shell = connect(args).await?;
    let (sx, sy) = shell.screen_dimensions();
    println!("📱 Device: {} size: {sx}x{sy}", shell.device_name());
    let screen = AdbScreen::new(shell);
    let capture = screen.capture().await?;
    tokio::fs::write("cli-screenshot.png", &capture.bytes).await?;
    println!(
        "✅ Screenshot #{} ({}ms) saved to cli-screenshot.png",
        capture.index, capture.duration_ms
    );
    Ok(())
}

async fn list_devices() -> CliResult {
    let devices = AdbShell::list_devices().await?;
    if devices.is_empty() {
        println!("❌ No devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "📱 {} (transport_id: {})",
            device.name,
            device.transport_id.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Run the automation loop until Ctrl-C or timeout
    Run,
    /// One-shot match of the template in an image file
    Match(PathBuf),
    Screenshot,
    Devices,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    pub mode: Mode,
    pub template: Option<PathBuf>,
    pub threshold: f32,
    pub interval_ms: u64,
    pub device: Option<String>,
    pub dry_run: bool,
    pub frames: Option<PathBuf>,
    pub debug_mode: bool,
    pub debug_mode_timeout_secs: Option<u64>,
    pub json: bool,
}

/// What the command line asked for.
#[derive(Debug, PartialEq)]
pub enum Command {
    Execute(Args),
    Help,
    Version,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: Mode::Run,
            template: None,
            threshold: crate::automation::LoopConfig::DEFAULT_THRESHOLD,
            interval_ms: crate::automation::LoopConfig::DEFAULT_INTERVAL.as_millis() as u64,
            device: None,
            dry_run: false,
            frames: None,
            debug_mode: false,
            debug_mode_timeout_secs: None,
            json: false,
        }
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, val: &str) -> Result<T, String> {
    val.parse::<T>()
        .map_err(|_| format!("Invalid {flag} value: {val}"))
}

impl Args {
    /// Parse the process arguments.
    pub fn parse() -> Result<Command, String> {
        Self::parse_from(env::args().skip(1))
    }

    /// Parse flags, excluding the program name.
    pub fn parse_from<I, S>(args: I) -> Result<Command, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Args::default();
        let mut mode: Option<Mode> = None;

        for arg in args {
            let arg = arg.as_ref();
            if arg == "--help" || arg == "-h" {
                return Ok(Command::Help);
            } else if arg == "--version" || arg == "-v" {
                return Ok(Command::Version);
            } else if arg == "--debug" {
                parsed.debug_mode = true;
            } else if arg == "--dry-run" {
                parsed.dry_run = true;
            } else if arg == "--json" {
                parsed.json = true;
            } else if arg == "--screenshot" || arg == "-s" {
                mode = Some(Mode::Screenshot);
            } else if arg == "--devices" {
                mode = Some(Mode::Devices);
            } else if let Some(val) = arg.strip_prefix("--match=") {
                mode = Some(Mode::Match(PathBuf::from(val)));
            } else if let Some(val) = arg.strip_prefix("--template=") {
                parsed.template = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--frames=") {
                parsed.frames = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--device=") {
                parsed.device = Some(val.to_string());
            } else if let Some(val) = arg.strip_prefix("--threshold=") {
                parsed.threshold = parse_value("threshold", val)?;
            } else if let Some(val) = arg.strip_prefix("--interval=") {
                parsed.interval_ms = parse_value("interval", val)?;
            } else if let Some(val) = arg.strip_prefix("--timeout=") {
                parsed.debug_mode_timeout_secs = Some(parse_value("timeout", val)?);
            } else {
                return Err(format!("Unknown argument: {arg}"));
            }
        }

        parsed.mode = mode.unwrap_or(Mode::Run);
        if matches!(parsed.mode, Mode::Run | Mode::Match(_)) && parsed.template.is_none() {
            return Err("--template=<png> is required".to_string());
        }
        Ok(Command::Execute(parsed))
    }
}

pub fn print_help() {
    println!("🤖 Image Clicker - tap wherever a template appears on screen");
    println!();
    println!("USAGE:");
    println!("    image-clicker --template=<png> [FLAGS]");
    println!();
    println!("MODES:");
    println!("    (default)           Run the capture → match → tap loop until Ctrl-C");
    println!("    --match=<png>       Match the template in an image file and print the result");
    println!("    --screenshot, -s    Take a screenshot and save to file (cli-screenshot.png)");
    println!("    --devices           List attached ADB devices");
    println!();
    println!("FLAGS:");
    println!("    --template=<png>    Reference image to search for");
    println!("    --threshold=F       Minimum confidence in (0, 1] (default 0.8)");
    println!("    --interval=MS       Cycle interval in milliseconds (default 1000)");
    println!("    --device=SERIAL     ADB device serial or host:port (default: first device)");
    println!("    --frames=<png>      Use a still image instead of device screenshots");
    println!("    --dry-run           Log taps instead of performing them");
    println!("    --json              Print match results as JSON");
    println!("    --debug             Enable debug output");
    println!("    --timeout=N         Auto-exit after N seconds");
    println!("    --help, -h          Show this help message");
    println!("    --version, -v       Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    image-clicker --template=button.png");
    println!("    image-clicker --template=button.png --threshold=0.7 --device=192.168.1.5:5555");
    println!("    image-clicker --template=button.png --frames=screen.png --dry-run --timeout=5");
    println!("    image-clicker --template=button.png --match=screen.png --json");
    println!("    image-clicker --screenshot");
}

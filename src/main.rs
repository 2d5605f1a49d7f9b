// FLOWLINE — SUPERVISOR BINARY
// Usage: flowline [--loglevel=LEVEL] [--preserve-latency] [--mock]
//                 <system-config> <pipeline-config>
//
// Exit codes: 0 clean shutdown, 1 process lock busy, 2 fatal init error.
// The NIC seam is satisfied by the in-process sim driver; hardware
// datapaths implement the same NicDriver contract and slot in here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use flowline::config::{PipelineConfig, SystemConfig};
use flowline::elements::ipsec_hmac;
use flowline::engines::host::HostComputeDevice;
use flowline::engines::DeviceRegistry;
use flowline::nic::SimNic;
use flowline::worker::supervisor::{LaunchOptions, Supervisor};
use flowline::Error;

/// Set from the signal handler; the main thread bridges it to the workers'
/// halt flag. Relaxed is enough for a monotonic flag.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::Relaxed);
}

struct CliArgs {
    loglevel: String,
    preserve_latency: bool,
    system_config: PathBuf,
    pipeline_config: PathBuf,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {program} [--loglevel=LEVEL] [--preserve-latency] [--mock] <system-config> <pipeline-config>\n\
         \n\
         Options:\n\
           -l, --loglevel=LEVEL   debug|info|notice|warning|error|critical|alert|emergency\n\
           --preserve-latency     process offload completions strictly in submission order\n\
           --mock                 accepted for compatibility; the sim NIC driver is the default"
    );
    std::process::exit(2);
}

fn parse_args() -> CliArgs {
    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().cloned().unwrap_or_else(|| "flowline".into());
    let mut loglevel = "info".to_string();
    let mut preserve_latency = false;
    let mut positional: Vec<PathBuf> = Vec::new();

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--preserve-latency" => preserve_latency = true,
            "--mock" => {}
            "-l" => {
                i += 1;
                match argv.get(i) {
                    Some(v) => loglevel = v.clone(),
                    None => usage(&program),
                }
            }
            other if other.starts_with("--loglevel=") => {
                loglevel = other["--loglevel=".len()..].to_string();
            }
            other if other.starts_with('-') => usage(&program),
            other => positional.push(PathBuf::from(other)),
        }
        i += 1;
    }
    if positional.len() != 2 {
        usage(&program);
    }
    let pipeline_config = positional.pop().unwrap();
    let system_config = positional.pop().unwrap();
    CliArgs { loglevel, preserve_latency, system_config, pipeline_config }
}

/// Syslog-style names onto tracing levels; the three highest severities
/// collapse onto error.
fn tracing_filter(level: &str) -> Option<&'static str> {
    Some(match level {
        "debug" => "debug",
        "info" => "info",
        "notice" => "info",
        "warning" => "warn",
        "error" => "error",
        "critical" | "alert" | "emergency" => "error",
        _ => return None,
    })
}

/// Single-instance lock in the temp directory; works for non-privileged
/// users. Held until process exit.
fn acquire_process_lock() -> Result<std::fs::File, Error> {
    let path = std::env::temp_dir().join("flowline.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|e| Error::ConfigIo { path: path.clone(), source: e })?;
    let rc = unsafe { libc::flock(std::os::unix::io::AsRawFd::as_raw_fd(&file), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(Error::LockBusy);
    }
    Ok(file)
}

fn run(args: &CliArgs) -> Result<(), Error> {
    let cfg = SystemConfig::load(&args.system_config)?;
    let pipeline = PipelineConfig::load(&args.pipeline_config)?;
    let params = cfg.params();

    // Compute devices, one instance per distinct name, kernels resolved at
    // registration so runtime dispatch is an index.
    let mut devices = DeviceRegistry::new();
    for conf in &cfg.threads.coproc {
        if conf.device != "host" {
            return Err(Error::ConfigInvalid(format!(
                "unknown compute device {:?} (this build links the host engine)",
                conf.device
            )));
        }
        if devices.get("host").is_err() {
            let contexts = params.coproc_ctx_per_compthread * cfg.threads.comp.len();
            let dev = HostComputeDevice::new(contexts.max(1));
            dev.register_kernel(ipsec_hmac::KERNEL_NAME, ipsec_hmac::hmac_sha1_host_kernel);
            devices.insert(Arc::new(dev));
        }
    }

    let nic = Arc::new(SimNic::new(cfg.num_ports, params.num_rxq_per_port));
    info!(ports = cfg.num_ports, "sim NIC driver attached (no hardware datapath linked)");

    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let mut sup = Supervisor::launch(
        &cfg,
        pipeline,
        nic,
        &devices,
        LaunchOptions { preserve_latency: args.preserve_latency },
    )?;
    info!("running; SIGINT/SIGTERM to stop");

    let halt = sup.halt_handle();
    while !SIGNALLED.load(Ordering::Relaxed) && !halt.is_set() {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    info!("terminating");
    sup.shutdown();
    Ok(())
}

fn main() {
    let args = parse_args();

    let Some(filter) = tracing_filter(&args.loglevel) else {
        eprintln!("invalid loglevel {:?}", args.loglevel);
        std::process::exit(2);
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let _lock = match acquire_process_lock() {
        Ok(f) => f,
        Err(Error::LockBusy) => {
            error!("another flowline instance holds the process lock");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "cannot acquire process lock");
            std::process::exit(2);
        }
    };

    match run(&args) {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "fatal");
            std::process::exit(e.exit_code());
        }
    }
}

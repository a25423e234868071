use clap::{Parser, Subcommand};
use log::{error, info};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use stubpatch::android::manifest_patch::ManifestPatch;
use stubpatch::android::ranks::AttributeRanks;
use stubpatch::android::signature::Fingerprint;
use stubpatch::config::PatchConfig;
use stubpatch::pipeline::Patcher;
use stubpatch::tools::apksigner::ApkSigner;
use stubpatch::tools::device::AdbDevice;

// Patches an installed app so the stub dex runs inside its process.
//Usage: stubpatch device <package>
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log every entry decision
    #[arg(short, long)]
    verbose: bool,

    /// JSON file overriding the default configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON rank table replacing the built-in one
    #[arg(long)]
    ranks: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct ManifestFlags {
    /// Also mark the application debuggable
    #[arg(long)]
    debuggable: bool,

    /// Process name for the application
    #[arg(long)]
    process: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull an installed package from a device, patch, align and sign it
    Device {
        package: String,
        /// Device serial, defaults to the first attached device
        #[arg(short, long)]
        serial: Option<String>,
        /// Output directory, defaults to patched-<timestamp>
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        flags: ManifestFlags,
    },
    /// Patch a local APK
    File {
        input: PathBuf,
        output: PathBuf,
        /// Certificate fingerprint to record, computed with apksigner when omitted
        #[arg(long)]
        fingerprint: Option<String>,
        /// Align and sign the result
        #[arg(long)]
        sign: bool,
        #[command(flatten)]
        flags: ManifestFlags,
    },
    /// Print the patched manifest of an APK as XML
    Manifest {
        input: PathBuf,
        #[command(flatten)]
        flags: ManifestFlags,
    },
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Do everything else with the error trap
    if let Err(e) = run(args) {
        error!("Aborted due to error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            error!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => PatchConfig::from_file(path)?,
        None => PatchConfig::default(),
    };
    let custom_ranks = args.ranks.as_deref().map(AttributeRanks::from_file).transpose()?;
    let ranks = match &custom_ranks {
        Some(ranks) => ranks,
        None => AttributeRanks::builtin()?,
    };
    let signer = ApkSigner::from_config(&config);

    match args.command {
        Command::Device {
            package,
            serial,
            out,
            flags,
        } => {
            let patcher = Patcher::new(&config, ranks, manifest_patch(&config, flags));
            let device = match serial {
                Some(serial) => AdbDevice::new(config.adb.as_str(), serial),
                None => AdbDevice::first_attached(config.adb.as_str())?,
            };
            let out = out.unwrap_or_else(default_output_dir);
            let outputs = patcher.patch_installed_package(&device, &signer, &package, &out)?;
            for path in &outputs {
                info!("wrote {}", path.display());
            }
            println!("{} successfully patched into {}", package, out.display());
        }
        Command::File {
            input,
            output,
            fingerprint,
            sign,
            flags,
        } => {
            if sign {
                config.ensure_keystore()?;
            }
            let patcher = Patcher::new(&config, ranks, manifest_patch(&config, flags));
            let fingerprint = match fingerprint {
                Some(value) => Fingerprint::new(value),
                None => signer.fingerprint(&input)?,
            };
            let report = patcher.patch_apk(&input, &output, &fingerprint)?;
            println!(
                "{} written with payload {} ({} units)",
                output.display(),
                report.payload_entry,
                report.unit_count
            );
            if sign {
                let aligned = signer.align(&output)?;
                signer.sign(&aligned)?;
                println!("signed {}", aligned.display());
            }
        }
        Command::Manifest { input, flags } => {
            let patcher = Patcher::new(&config, ranks, manifest_patch(&config, flags));
            println!("{}", patcher.render_patched_manifest(Path::new(&input))?);
        }
    }
    Ok(())
}

fn manifest_patch(config: &PatchConfig, flags: ManifestFlags) -> ManifestPatch {
    ManifestPatch::from_config(config)
        .with_debuggable(flags.debuggable)
        .with_process(flags.process)
}

fn default_output_dir() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    PathBuf::from(format!("patched-{stamp}"))
}

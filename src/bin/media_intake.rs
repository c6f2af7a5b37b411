// media_intake - vision and sonic intake daemon
// Serves both endpoints over HTTP and returns per-request logs with each result

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use media_intake::config::DEFAULT_TARGET_SAMPLE_RATE;
use media_intake::{
    AlphaPolicy, AppState, CaptureConfig, CaptureHub, CapturePolicy, ChannelOrder,
    InputErrorPolicy, IntakeConfig, SonicConfig, VisionConfig,
};

#[derive(Parser)]
#[command(name = "media_intake", version, about = "Media intake daemon - image and audio normalization")]
struct Args {
    /// Address to bind
    #[arg(long, env = "MEDIA_INTAKE_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, env = "MEDIA_INTAKE_PORT", default_value_t = 8000)]
    port: u16,

    /// Path of the image endpoint
    #[arg(long, env = "MEDIA_INTAKE_VISION_PATH", default_value = "/vision_entrance")]
    vision_path: String,

    /// Path of the audio endpoint
    #[arg(long, env = "MEDIA_INTAKE_SONIC_PATH", default_value = "/sonic_entrance")]
    sonic_path: String,

    /// Sample rate every waveform is resampled to
    #[arg(long, env = "MEDIA_INTAKE_SAMPLE_RATE", default_value_t = DEFAULT_TARGET_SAMPLE_RATE)]
    target_sample_rate: u32,

    #[arg(long, env = "MEDIA_INTAKE_CHANNEL_ORDER", value_enum, default_value_t = ChannelOrder::Bgr)]
    channel_order: ChannelOrder,

    #[arg(long, env = "MEDIA_INTAKE_ALPHA", value_enum, default_value_t = AlphaPolicy::Composite)]
    alpha: AlphaPolicy,

    /// Rotate images upright instead of reporting the EXIF orientation
    #[arg(long, env = "MEDIA_INTAKE_APPLY_ORIENTATION")]
    apply_orientation: bool,

    #[arg(long, env = "MEDIA_INTAKE_VISION_INPUT_ERRORS", value_enum, default_value_t = InputErrorPolicy::Envelope)]
    vision_input_errors: InputErrorPolicy,

    #[arg(long, env = "MEDIA_INTAKE_SONIC_INPUT_ERRORS", value_enum, default_value_t = InputErrorPolicy::Envelope)]
    sonic_input_errors: InputErrorPolicy,

    /// Per-request log capture routing
    #[arg(long, env = "MEDIA_INTAKE_CAPTURE", value_enum, default_value_t = CapturePolicy::Isolated)]
    capture_policy: CapturePolicy,

    /// Log target prefixes returned with each response (empty = everything)
    #[arg(long, env = "MEDIA_INTAKE_CAPTURE_TARGETS", value_delimiter = ',', default_value = "media_intake")]
    capture_targets: Vec<String>,

    /// Allow cross-origin requests from any origin
    #[arg(long, env = "MEDIA_INTAKE_CORS")]
    cors: bool,

    /// Maximum request body in MiB
    #[arg(long, env = "MEDIA_INTAKE_MAX_BODY_MB", default_value_t = 50)]
    max_body_mb: usize,
}

impl Args {
    fn config(&self) -> IntakeConfig {
        IntakeConfig {
            vision: VisionConfig {
                path: self.vision_path.clone(),
                channel_order: self.channel_order,
                alpha: self.alpha,
                apply_orientation: self.apply_orientation,
                input_errors: self.vision_input_errors,
            },
            sonic: SonicConfig {
                path: self.sonic_path.clone(),
                target_sample_rate: self.target_sample_rate,
                input_errors: self.sonic_input_errors,
            },
            capture: CaptureConfig {
                policy: self.capture_policy,
                targets: self.capture_targets.clone(),
            },
            max_body_bytes: self.max_body_mb * 1024 * 1024,
            cors: self.cors,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config();
    let hub = CaptureHub::new(&config.capture);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(hub.layer())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("Starting media intake daemon");
    info!(
        "   Capture: {:?} on {:?}",
        config.capture.policy, config.capture.targets
    );
    info!(
        "   Channel order: {} | Alpha: {:?} | Apply orientation: {}",
        config.vision.channel_order.as_str(),
        config.vision.alpha,
        config.vision.apply_orientation
    );
    info!("   Target sample rate: {} Hz", config.sonic.target_sample_rate);
    if config.cors {
        info!("   CORS: any origin");
    }

    let state = AppState::new(&config, hub);
    let addr = SocketAddr::new(args.host, args.port);

    media_intake::serve(addr, state)
        .await
        .with_context(|| format!("Intake server on {} failed", addr))
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facestream_core::{Embedding, FrameRef, Model, ModelHandle, OnnxModel, Pipeline, PixelFormat};
use facestream_hw::Camera;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUS_NAME: &str = "org.facestream.FaceStream1";
const OBJECT_PATH: &str = "/org/facestream/FaceStream1";
const INTERFACE: &str = "org.facestream.FaceStream1";

#[derive(Parser)]
#[command(name = "facestream", about = "Face embedding pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Print the daemon's most recent embedding
    Latest,
    /// Switch the daemon between front and back cameras
    Toggle,
    /// Compute an embedding for an image file
    Embed {
        /// Image file (any format the `image` crate decodes)
        image: PathBuf,
        /// Model path (defaults to the installed model)
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Quantization sidecar (defaults to <model>.quant.toml)
        #[arg(short, long)]
        quant: Option<PathBuf>,
    },
    /// Compare two embeddings written by `embed`
    Compare { a: PathBuf, b: PathBuf },
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame and report what the camera delivers
    Probe {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Also run the captured frame through the model
        #[arg(long)]
        embed: bool,
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let json = call_daemon("Status").await?;
            println!("{}", pretty(&json)?);
        }
        Commands::Latest => {
            let json = call_daemon("LatestEmbedding").await?;
            println!("{}", pretty(&json)?);
        }
        Commands::Toggle => {
            let position = call_daemon("ToggleCamera").await?;
            println!("switching to {position} camera");
        }
        Commands::Embed { image, model, quant } => {
            let rgb = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?
                .to_rgb8();
            let frame = FrameRef {
                data: rgb.as_raw(),
                width: rgb.width(),
                height: rgb.height(),
                format: PixelFormat::Rgb24,
                timestamp: Duration::ZERO,
                sequence: 0,
            };
            let embedding = embed_frame(&frame, model, quant)?;
            println!("{}", serde_json::to_string_pretty(&embedding)?);
        }
        Commands::Compare { a, b } => {
            let a = read_embedding(&a)?;
            let b = read_embedding(&b)?;
            if a.len() != b.len() {
                bail!("embedding lengths differ: {} vs {}", a.len(), b.len());
            }
            println!("cosine similarity: {:.4}", a.similarity(&b));
            println!("euclidean distance: {:.4}", a.euclidean_distance(&b));
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Probe {
            device,
            width,
            height,
            embed,
            model,
        } => {
            let camera = Camera::open(&device, width, height)?;
            println!(
                "{device}: {}x{} {} ({:?})",
                camera.width, camera.height, camera.format, camera.fourcc
            );
            let frame = camera.capture_frame()?;
            let view = frame.view();
            println!(
                "captured frame #{}: {} bytes, expected {}",
                view.sequence,
                view.data.len(),
                view.format
                    .required_len(view.width, view.height)
                    .map_or_else(|| "?".to_string(), |n| n.to_string())
            );
            if embed {
                let embedding = embed_frame(&view, model, None)?;
                println!("embedding: {} values", embedding.len());
            }
        }
    }

    Ok(())
}

async fn call_daemon(method: &str) -> Result<String> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let reply = conn
        .call_method(Some(BUS_NAME), OBJECT_PATH, Some(INTERFACE), method, &())
        .await
        .with_context(|| format!("facestreamd {method} call failed (is the daemon running?)"))?;
    Ok(reply.body().deserialize::<String>()?)
}

fn pretty(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Load the model on this thread and run one frame through the pipeline.
fn embed_frame(frame: &FrameRef<'_>, model: Option<PathBuf>, quant: Option<PathBuf>) -> Result<Embedding> {
    let model_path = model.unwrap_or_else(|| {
        facestream_core::default_model_dir().join("face_embedding_int8.onnx")
    });
    let model_path = model_path.to_string_lossy().into_owned();
    tracing::debug!(model = %model_path, "loading model");

    let handle = ModelHandle::new();
    handle.load_blocking(|| {
        let model: Box<dyn Model> = match &quant {
            Some(sidecar) => Box::new(OnnxModel::load_with_sidecar(&model_path, sidecar)?),
            None => Box::new(OnnxModel::load(&model_path)?),
        };
        Ok(model)
    })?;

    let mut pipeline = Pipeline::new(handle);
    Ok(pipeline.process_frame(frame)?)
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not an embedding", path.display()))
}

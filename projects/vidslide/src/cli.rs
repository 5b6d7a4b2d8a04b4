use crate::batch::RestoreMode;
use crate::config::{ContentMode, ExtractParams, SpeedMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract slides from a single video
    Extract(ExtractArgs),
    /// Work with batches of videos
    #[command(subcommand)]
    Batch(BatchCommand),
}

#[derive(clap::Args, Debug)]
pub struct ExtractArgs {
    /// Video file to process
    pub video: PathBuf,

    /// Directory the slide images are written to
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub params: ParamArgs,
}

#[derive(Subcommand, Debug)]
pub enum BatchCommand {
    /// Create a batch from videos or folders of videos and process it
    Run {
        /// Video files or folders to scan
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Root directory for batch output
        #[arg(long, env = "VIDSLIDE_ROOT")]
        root: PathBuf,

        /// Concurrent extractions (defaults to what the machine can afford)
        #[arg(long, env = "VIDSLIDE_WORKERS")]
        workers: Option<usize>,

        /// Name the first video; the rest continue its numbering (e.g. "第1讲")
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        params: ParamArgs,
    },
    /// Continue a batch after a restart
    Resume {
        /// Batch id, as shown by `batch status`
        id: String,

        #[arg(long, env = "VIDSLIDE_ROOT")]
        root: PathBuf,

        /// Requeue failed and interrupted tasks, keeping their images
        #[arg(long)]
        retry_failed: bool,
    },
    /// Bring an archived task back
    Restore {
        id: String,
        task: String,

        #[arg(long, env = "VIDSLIDE_ROOT")]
        root: PathBuf,

        #[arg(long, value_enum, default_value_t = RestoreMode::Resume)]
        mode: RestoreMode,
    },
    /// Copy a finished task's slides into a package
    Package {
        id: String,
        task: String,

        #[arg(long, env = "VIDSLIDE_ROOT")]
        root: PathBuf,

        #[arg(long, default_value = "images")]
        format: String,
    },
    /// List batches under the root
    Status {
        #[arg(long, env = "VIDSLIDE_ROOT")]
        root: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ParamArgs {
    /// Mean pixel difference (0-255) that counts as a new slide
    #[arg(long, env = "VIDSLIDE_THRESHOLD", default_value_t = 5.0)]
    pub threshold: f64,

    #[arg(long, value_enum, default_value_t = ContentMode::Slides)]
    pub mode: ContentMode,

    #[arg(long, value_enum, default_value_t = SpeedMode::Fast)]
    pub speed: SpeedMode,

    /// Save slides even if they match a recently saved one
    #[arg(long)]
    pub no_history: bool,

    #[arg(long, default_value_t = 5)]
    pub max_history: usize,

    /// Compare the whole frame instead of the lower-right region
    #[arg(long)]
    pub no_roi: bool,

    /// Compare at full resolution
    #[arg(long)]
    pub no_fast_compare: bool,

    #[arg(long, env = "VIDSLIDE_NO_GPU")]
    pub no_gpu: bool,

    /// Always decode every frame
    #[arg(long)]
    pub no_keyframe_seek: bool,
}

impl From<ParamArgs> for ExtractParams {
    fn from(args: ParamArgs) -> Self {
        ExtractParams {
            threshold: args.threshold,
            mode: args.mode,
            speed: args.speed,
            enable_history: !args.no_history,
            max_history: args.max_history,
            use_roi: !args.no_roi,
            fast_compare: !args.no_fast_compare,
            use_gpu: !args.no_gpu,
            keyframe_seek: !args.no_keyframe_seek,
        }
    }
}

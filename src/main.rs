// vodgrab: download a video on demand from its DASH master.mpd manifest
//
// Run with `vodgrab 201234567 my-lecture`
//

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use vodgrab::fetch::{AUDIO_CHUNK_SEGMENTS, DEFAULT_BASE_URL, MAX_REQUEST_BYTES, VIDEO_CHUNK_SEGMENTS};
use vodgrab::{http_client, manifest_url, output_path, Coalescing, Downloader, ProgressObserver, VodgrabError};


#[derive(Parser, Debug)]
#[command(author, version, about = "Download a video from its DASH master.mpd manifest", long_about = None)]
struct Cli {
    /// Identifier of the video. The manifest is fetched from <BASE_URL>/<VIDEO_ID>/master.mpd
    video_id: String,

    /// Name of the output file, without extension (defaults to the video identifier)
    name: Option<String>,

    /// Host serving the manifests
    #[arg(long, env = "VODGRAB_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Value of the Referer header sent with every request (defaults to the base URL)
    #[arg(long, env = "VODGRAB_REFERER")]
    referer: Option<String>,

    /// Location of the ffmpeg binary, if not in PATH
    #[arg(long, env = "VODGRAB_FFMPEG")]
    ffmpeg: Option<String>,

    /// Directory in which the output file is written
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Directory for the temporary stream files (defaults to the system temporary directory)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Seconds to wait for a connection, or for more data while reading a response
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Number of segment requests kept in flight at once
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=64))]
    concurrency: u16,

    /// Fetch every segment with its own request, even for contiguous byte ranges
    #[arg(long)]
    no_coalesce: bool,

    /// Maximum number of video segments merged into one range request
    #[arg(long, default_value_t = VIDEO_CHUNK_SEGMENTS)]
    video_chunk_segments: usize,

    /// Maximum number of audio segments merged into one range request
    #[arg(long, default_value_t = AUDIO_CHUNK_SEGMENTS)]
    audio_chunk_segments: usize,

    /// Maximum size in octets of one merged range request
    #[arg(long, default_value_t = MAX_REQUEST_BYTES)]
    max_request_bytes: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors, and do not display a progress bar
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}


struct DownloadProgressBar {
    bar: ProgressBar,
}

impl DownloadProgressBar {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl ProgressObserver for DownloadProgressBar {
    fn update(&self, percent: u32, message: &str) {
        if percent <= 100 {
            self.bar.set_position(percent.into());
            self.bar.set_message(message.to_string());
        }
        if percent == 100 {
            self.bar.finish();
        }
    }
}


fn setup_logging(verbose: u8, quiet: bool) {
    use tracing_subscriber::{EnvFilter, fmt, fmt::time::LocalTime, prelude::*};
    use time::macros::format_description;

    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let timer = LocalTime::new(format_description!("[hour]:[minute]:[second]"));
    let fmt_layer = fmt::layer()
        .compact()
        .with_timer(timer)
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{level},reqwest=warn,hyper=warn,hyper_util=warn,h2=warn")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}


async fn run(cli: Cli, progress: Option<Arc<DownloadProgressBar>>) -> Result<PathBuf, VodgrabError> {
    let url = manifest_url(&cli.base_url, &cli.video_id)?;
    let client = http_client(Duration::from_secs(cli.timeout))?;
    let referer = cli.referer.clone().unwrap_or_else(|| cli.base_url.clone());
    let out = output_path(&cli.output_dir, cli.name.as_deref().unwrap_or(&cli.video_id));
    debug!("Downloading {url} to {}", out.display());
    let mut dl = Downloader::new(url.as_str())
        .with_http_client(client)
        .with_referer(&referer)
        .concurrent_fetches(cli.concurrency.into());
    if let Some(ffmpeg) = &cli.ffmpeg {
        dl = dl.with_ffmpeg(ffmpeg);
    }
    if let Some(tmp_dir) = cli.tmp_dir {
        dl = dl.with_tmp_dir(tmp_dir);
    }
    dl = if cli.no_coalesce {
        dl.without_segment_coalescing()
    } else {
        dl.with_segment_coalescing(Coalescing {
            video_segments: cli.video_chunk_segments,
            audio_segments: cli.audio_chunk_segments,
            max_bytes: cli.max_request_bytes,
        })
    };
    if let Some(pb) = progress {
        dl = dl.add_progress_observer(pb);
    }
    dl.download_to(out).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);
    let progress = (!cli.quiet).then(|| Arc::new(DownloadProgressBar::new()));
    match run(cli, progress.clone()).await {
        Ok(path) => {
            println!("Downloaded to {}", path.display());
            ExitCode::SUCCESS
        },
        Err(e) => {
            if let Some(pb) = progress {
                pb.bar.abandon();
            }
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

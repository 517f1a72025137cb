//! Shared code for our test harness.

#![allow(dead_code)]

use fs_err as fs;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use vodgrab::{Muxer, VodgrabError};


static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, fmt::time::LocalTime, prelude::*};
    use time::macros::format_description;

    TRACING_INIT.call_once(|| {
        let timer = LocalTime::new(format_description!("[hour]:[minute]:[second]"));
        let fmt_layer = fmt::layer()
            .compact()
            .with_timer(timer)
            .with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn,h2=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}


/// One request received by the [`MediaServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub path: String,
    pub range: Option<String>,
    pub referer: Option<String>,
}

/// An in-process HTTP server serving a fixed set of resources, that logs every request it receives.
/// Requests for unknown paths receive a 404 response.
#[derive(Default)]
pub struct MediaServer {
    resources: Mutex<HashMap<String, (String, Vec<u8>)>>,
    failures: Mutex<HashMap<String, StatusCode>>,
    delays: Mutex<HashMap<String, Duration>>,
    trickles: Mutex<HashMap<String, Duration>>,
    redirects: Mutex<HashMap<String, String>>,
    ignore_ranges: AtomicBool,
    log: Mutex<Vec<LoggedRequest>>,
}

impl MediaServer {
    pub fn new() -> MediaServer {
        MediaServer::default()
    }

    pub fn with_resource(self, path: &str, content_type: &str, body: impl Into<Vec<u8>>) -> MediaServer {
        self.add_resource(path, content_type, body);
        self
    }

    pub fn with_manifest(self, path: &str, xml: &str) -> MediaServer {
        self.with_resource(path, "application/dash+xml", xml)
    }

    /// Respond to requests for `path` with `status` and an empty body.
    pub fn with_failure(self, path: &str, status: StatusCode) -> MediaServer {
        self.failures.lock().unwrap().insert(String::from(path), status);
        self
    }

    /// Redirect requests for `path` to `location` with a 302 response.
    pub fn with_redirect(self, path: &str, location: &str) -> MediaServer {
        self.redirects.lock().unwrap().insert(String::from(path), String::from(location));
        self
    }

    /// Wait for `delay` before responding to requests for `path`.
    pub fn with_delay(self, path: &str, delay: Duration) -> MediaServer {
        self.delays.lock().unwrap().insert(String::from(path), delay);
        self
    }

    /// Send the body of `path` two octets at a time, waiting for `gap` before each chunk.
    pub fn with_trickle(self, path: &str, gap: Duration) -> MediaServer {
        self.trickles.lock().unwrap().insert(String::from(path), gap);
        self
    }

    /// Behave like a server without range support: always return the full resource.
    pub fn ignoring_ranges(self) -> MediaServer {
        self.ignore_ranges.store(true, Ordering::SeqCst);
        self
    }

    pub fn add_resource(&self, path: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.resources.lock().unwrap()
            .insert(String::from(path), (String::from(content_type), body.into()));
    }

    pub async fn serve(self) -> RunningServer {
        let state = Arc::new(self);
        let app = Router::new()
            .fallback(send_resource)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await
            .expect("binding test server");
        let addr = listener.local_addr().expect("obtaining test server address");
        tokio::spawn(async move {
            axum::serve(listener, app).await
                .expect("running test server")
        });
        RunningServer { addr, state }
    }
}

pub struct RunningServer {
    pub addr: SocketAddr,
    state: Arc<MediaServer>,
}

impl RunningServer {
    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn add_resource(&self, path: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.state.add_resource(path, content_type, body);
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state.log.lock().unwrap().clone()
    }

    /// The paths requested so far, in order, excluding the manifest request.
    pub fn segment_paths(&self) -> Vec<String> {
        self.requests().into_iter()
            .map(|r| r.path)
            .filter(|p| !p.ends_with(".mpd"))
            .collect()
    }
}

fn response_body(content: Vec<u8>, gap: Option<Duration>) -> Body {
    let Some(gap) = gap else {
        return Body::from(content);
    };
    let chunks: Vec<Bytes> = content.chunks(2).map(Bytes::copy_from_slice).collect();
    let stream = futures_util::stream::iter(chunks)
        .then(move |chunk| async move {
            tokio::time::sleep(gap).await;
            Ok::<Bytes, std::io::Error>(chunk)
        });
    Body::from_stream(stream)
}

fn parse_range_header(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn send_resource(State(state): State<Arc<MediaServer>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    let range = headers.get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let referer = headers.get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.log.lock().unwrap().push(LoggedRequest { path: path.clone(), range: range.clone(), referer });
    let delay = state.delays.lock().unwrap().get(&path).copied();
    if let Some(d) = delay {
        tokio::time::sleep(d).await;
    }
    let redirect = state.redirects.lock().unwrap().get(&path).cloned();
    if let Some(location) = redirect {
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap();
    }
    let failure = state.failures.lock().unwrap().get(&path).copied();
    if let Some(status) = failure {
        return Response::builder()
            .status(status)
            .body(Body::empty())
            .unwrap();
    }
    let resource = state.resources.lock().unwrap().get(&path).cloned();
    let Some((content_type, body)) = resource else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap();
    };
    let gap = state.trickles.lock().unwrap().get(&path).copied();
    let wanted = if state.ignore_ranges.load(Ordering::SeqCst) {
        None
    } else {
        range.as_deref().map(parse_range_header)
    };
    match wanted {
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .body(response_body(body, gap))
            .unwrap(),
        Some(Some((start, end))) if start <= end && end < body.len() => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{}", body.len()))
            .body(response_body(body[start..=end].to_vec(), gap))
            .unwrap(),
        Some(_) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .body(Body::empty())
            .unwrap(),
    }
}


/// Content of a fake media segment: recognisable, and different for each name.
pub fn segment_bytes(name: &str) -> Vec<u8> {
    format!("<{name}>").into_bytes()
}


/// One invocation of a [`RecordingMuxer`].
#[derive(Debug, Clone)]
pub struct MuxCall {
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub output: PathBuf,
    pub video: Vec<u8>,
    pub audio: Vec<u8>,
}

/// A muxer that writes the concatenation of the video and audio streams to the output file, and
/// records each call.
#[derive(Debug, Default)]
pub struct RecordingMuxer {
    calls: Mutex<Vec<MuxCall>>,
}

impl RecordingMuxer {
    pub fn new() -> Arc<RecordingMuxer> {
        Arc::new(RecordingMuxer::default())
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Muxer for RecordingMuxer {
    fn combine(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), VodgrabError> {
        let v = fs::read(video)
            .map_err(|e| VodgrabError::Io(e, String::from("reading video stream")))?;
        let a = fs::read(audio)
            .map_err(|e| VodgrabError::Io(e, String::from("reading audio stream")))?;
        let mut content = v.clone();
        content.extend_from_slice(&a);
        fs::write(output, &content)
            .map_err(|e| VodgrabError::Io(e, String::from("writing output")))?;
        self.calls.lock().unwrap().push(MuxCall {
            video_path: video.to_path_buf(),
            audio_path: audio.to_path_buf(),
            output: output.to_path_buf(),
            video: v,
            audio: a,
        });
        Ok(())
    }
}

/// A muxer that leaves a truncated output file behind and then fails.
#[derive(Debug, Default)]
pub struct FailingMuxer {}

impl Muxer for FailingMuxer {
    fn combine(&self, _video: &Path, _audio: &Path, output: &Path) -> Result<(), VodgrabError> {
        fs::write(output, b"partial")
            .map_err(|e| VodgrabError::Io(e, String::from("writing output")))?;
        Err(VodgrabError::Muxing {
            status: Some(1),
            diagnostics: String::from("Invalid data found when processing input"),
        })
    }
}


pub fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir).unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    entries.sort();
    entries
}


/// A manifest with one video and one audio Representation, each using a SegmentList of separate
/// segment files, relative to the manifest location.
pub fn segment_list_mpd() -> String {
    String::from(r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S"
     profiles="urn:mpeg:dash:profile:isoff-main:2011">
  <Period id="0" duration="PT8S">
    <AdaptationSet id="0" contentType="video" mimeType="video/mp4">
      <Representation id="v720" bandwidth="1000000" width="1280" height="720" codecs="avc1.64001f">
        <SegmentList timescale="1000" duration="4000">
          <Initialization sourceURL="init-v.mp4"/>
          <SegmentURL media="v1.m4s"/>
          <SegmentURL media="v2.m4s"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
    <AdaptationSet id="1" contentType="audio" mimeType="audio/mp4" lang="en">
      <Representation id="a128" bandwidth="128000" codecs="mp4a.40.2" audioSamplingRate="48000">
        <SegmentList timescale="1000" duration="4000">
          <Initialization sourceURL="init-a.mp4"/>
          <SegmentURL media="a1.m4s"/>
          <SegmentURL media="a2.m4s"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#)
}

/// A server for `segment_list_mpd()` under the `/{id}/master.mpd` layout.
pub fn segment_list_server(id: &str) -> MediaServer {
    let mut server = MediaServer::new()
        .with_manifest(&format!("/{id}/master.mpd"), &segment_list_mpd());
    for name in ["init-v.mp4", "v1.m4s", "v2.m4s"] {
        server = server.with_resource(&format!("/{id}/{name}"), "video/mp4", segment_bytes(name));
    }
    for name in ["init-a.mp4", "a1.m4s", "a2.m4s"] {
        server = server.with_resource(&format!("/{id}/{name}"), "audio/mp4", segment_bytes(name));
    }
    server
}

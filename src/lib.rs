//! A Rust library and command-line tool for downloading a single video on demand from a DASH MPD
//! manifest. The manifest (usually named `master.mpd`) is fetched over HTTP, parsed into typed
//! Rust structs, the best video and the best audio representation are selected, their segments
//! are downloaded in order, and the two resulting streams are muxed into one playable file by an
//! external utility (ffmpeg by default).
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP) describes the available encodings of a piece of content in a Media
//! Presentation Description (MPD), an XML manifest. Each AdaptationSet groups the Representations
//! of one media kind (audio or video); each Representation is one concrete encoding, made of an
//! initialization segment followed by an ordered sequence of media segments.
//!
//! The library is organised as a strictly linear pipeline:
//!
//! - [`fetch`]: retrieves the manifest, drives the segment downloads and the final mux;
//! - [`manifest`]: turns the parsed [`MPD`] into one selected video and one selected audio track,
//!   with every segment reference resolved to an absolute URL;
//! - [`ffmpeg`]: the [`ffmpeg::Muxer`] capability and its subprocess implementation.
//!
//! ## Supported manifest features
//!
//! - static (VOD) manifests, first Period only
//! - BaseURL inheritance at MPD, Period, AdaptationSet and Representation level
//! - SegmentList (with optional byte ranges), SegmentTemplate with SegmentTimeline or
//!   `@duration`, SegmentBase and single-resource representations
//! - data URLs for embedded segments
//!
//! ## Limitations / unsupported features
//!
//! - dynamic (live) manifests
//! - content protected by DRM
//! - adaptive bitrate switching, resumable downloads, automatic retries

#![allow(non_snake_case)]

pub mod fetch;
pub mod ffmpeg;
pub mod manifest;
mod media;

pub use fetch::{http_client, manifest_url, Coalescing, Downloader, HttpClient, ProgressObserver};
pub use ffmpeg::{FfmpegMuxer, Muxer};
pub use media::output_path;
pub use manifest::{interpret, select_tracks, ByteRange, SegmentRef, SelectedTrack, SelectedTracks, TrackKind};

use serde::{de, Deserialize};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;


#[derive(thiserror::Error, Debug)]
pub enum VodgrabError {
    #[error("fetch error {0}")]
    Fetch(String),
    #[error("manifest parse error {0}")]
    Parsing(String),
    #[error("fetching {track} segment #{index} from {url}: {reason}")]
    SegmentFetch {
        track: TrackKind,
        index: usize,
        url: String,
        reason: String,
    },
    #[error("muxing error (exit status {}): {diagnostics}", exit_status(.status))]
    Muxing {
        status: Option<i32>,
        diagnostics: String,
    },
    #[error("I/O error {1}")]
    Io(#[source] std::io::Error, String),
}

fn exit_status(status: &Option<i32>) -> String {
    status.map_or_else(|| String::from("none"), |code| code.to_string())
}

pub(crate) fn parse_error(why: &str, e: impl std::fmt::Display) -> VodgrabError {
    VodgrabError::Parsing(format!("{why}: {e}"))
}


static XS_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(r"^(?P<sign>[+-])?P",
                       r"(?:(?P<years>\d+)Y)?",
                       r"(?:(?P<months>\d+)M)?",
                       r"(?:(?P<weeks>\d+)W)?",
                       r"(?:(?P<days>\d+)D)?",
                       r"(?:(?P<hastime>T)",
                       r"(?:(?P<hours>\d+)H)?",
                       r"(?:(?P<minutes>\d+)M)?",
                       r"(?:(?P<seconds>\d+)(?:(?P<nanoseconds>[.,]\d+)?)S)?",
                       r")?"))
        .expect("compiling xs:duration regex")
});

// Parse an XML duration string, as per https://www.w3.org/TR/xmlschema-2/#duration
//
// Examples: "PT0H0M30.030S", "PT1.2S", "P1DT2H", "PT634.566S". Months are counted as 30 days and
// years as 365 days. Negative durations and fractional parts on anything but seconds are rejected.
fn parse_xs_duration(s: &str) -> Result<Duration, VodgrabError> {
    let m = XS_DURATION.captures(s)
        .ok_or_else(|| VodgrabError::Parsing(format!("invalid xs:duration {s}")))?;
    if m.name("hastime").is_none() &&
        m.name("years").is_none() &&
        m.name("months").is_none() &&
        m.name("weeks").is_none() &&
        m.name("days").is_none() {
            return Err(VodgrabError::Parsing(format!("empty xs:duration {s}")));
        }
    if m.name("sign").is_some_and(|sign| sign.as_str() == "-") {
        return Err(VodgrabError::Parsing(format!("negative xs:duration {s}")));
    }
    let mut secs: u64 = 0;
    for (group, multiplier) in [("seconds", 1),
                                ("minutes", 60),
                                ("hours", 60 * 60),
                                ("days", 60 * 60 * 24),
                                ("weeks", 60 * 60 * 24 * 7),
                                ("months", 60 * 60 * 24 * 30),
                                ("years", 60 * 60 * 24 * 365)] {
        if let Some(value) = m.name(group) {
            let count: u64 = value.as_str().parse()
                .map_err(|e| parse_error(&format!("xs:duration {group} in {s}"), e))?;
            secs = count.checked_mul(multiplier)
                .and_then(|v| secs.checked_add(v))
                .ok_or_else(|| VodgrabError::Parsing(format!("xs:duration overflow in {s}")))?;
        }
    }
    let mut nsecs: u32 = 0;
    if let Some(fraction) = m.name("nanoseconds") {
        // drop the leading separator and keep nanosecond precision
        let digits: String = fraction.as_str()[1..].chars().take(9).collect();
        nsecs = format!("{digits:0<9}").parse()
            .map_err(|e| parse_error(&format!("xs:duration fraction in {s}"), e))?;
    }
    Ok(Duration::new(secs, nsecs))
}

// Deserialize an optional xs:duration attribute. A missing attribute yields None, a malformed one
// is a deserialization error.
fn deserialize_xs_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    match <Option<String>>::deserialize(deserializer)? {
        Some(xs) => parse_xs_duration(xs.trim())
            .map(Some)
            .map_err(de::Error::custom),
        None => Ok(None),
    }
}


// The subset of the MPD schema (ISO/IEC 23009-1) needed to locate the segments of a VOD
// presentation. quick-xml maps attributes to fields whose name starts with "@"; unknown elements
// and attributes are ignored.

/// The title of the media stream.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Title {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

/// Metainformation concerning the media stream.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct ProgramInformation {
    pub Title: Option<Title>,
}

/// A URI string that specifies a common location for segments and other resources. Relative
/// values are resolved against the BaseURL of the enclosing element.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct BaseURL {
    #[serde(rename = "$text")]
    pub base: String,
}

/// Describes a sequence of contiguous segments with identical duration.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct S {
    /// start time, in timescale units
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    /// the segment duration, in timescale units
    #[serde(rename = "@d")]
    pub d: u64,
    /// the repeat count; negative means "until the next S@t or the end of the Period"
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentTimeline {
    #[serde(rename = "S")]
    pub segments: Vec<S>,
}

/// The initialization segment of a Representation: a URL relative to the current BaseURL, and/or a
/// byte range within it.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

/// Template-based segment URL construction using identifiers such as `$Number$` and `$Time$`.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<u64>,
    // an unsigned int in the schema, but floating point values are seen in the wild
    #[serde(rename = "@duration")]
    pub duration: Option<f64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    pub SegmentTimeline: Option<SegmentTimeline>,
}

/// A single resource holding the whole Representation, with an optional byte range for the
/// initialization data.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
}

/// The URL (and optional byte range) of one media segment.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

/// An explicit list of media segments, in playback order.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentList {
    pub Initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL")]
    pub segment_urls: Vec<SegmentURL>,
}

/// A representation describes one version of the content, using a specific encoding and bitrate.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// An RFC6381 string, <https://tools.ietf.org/html/rfc6381>
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    pub BaseURL: Vec<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentBase: Option<SegmentBase>,
    pub SegmentList: Option<SegmentList>,
}

/// Contains the set of Representations of one media kind.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct AdaptationSet {
    // eg "audio", "video", "text"
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    // eg "video/mp4"
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    pub BaseURL: Vec<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
    #[serde(rename = "Representation")]
    pub representations: Vec<Representation>,
}

/// A chunk of the content with a start time and a duration.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Period {
    #[serde(rename = "@duration", deserialize_with = "deserialize_xs_duration")]
    pub duration: Option<Duration>,
    pub BaseURL: Vec<BaseURL>,
    #[serde(rename = "AdaptationSet")]
    pub adaptations: Vec<AdaptationSet>,
}

/// The root node of a parsed DASH MPD manifest.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct MPD {
    /// The Presentation Type, either "static" or "dynamic".
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@mediaPresentationDuration", deserialize_with = "deserialize_xs_duration")]
    pub mediaPresentationDuration: Option<Duration>,
    #[serde(rename = "Period")]
    pub periods: Vec<Period>,
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    pub ProgramInformation: Option<ProgramInformation>,
}


// quick-xml's deserializer ignores the name of the root element, so an HTML page or some other XML
// document would happily deserialize to an empty MPD. Check it up front.
fn check_root_element(xml: &str) -> Result<(), VodgrabError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"MPD" {
                    return Ok(());
                }
                return Err(VodgrabError::Parsing(format!(
                    "expecting an MPD root element, found <{}>",
                    String::from_utf8_lossy(name.as_ref()))));
            },
            Ok(Event::Eof) => return Err(VodgrabError::Parsing(String::from("no root element"))),
            Ok(_) => continue,
            Err(e) => return Err(parse_error("reading manifest XML", e)),
        }
    }
}

/// Parse an MPD manifest, provided as an XML string, returning an `MPD` node.
///
/// Fails if the text is not well-formed XML, if its root element is not `MPD`, or if an element or
/// attribute has an unexpected type; the error message names the path of the offending node.
pub fn parse(xml: &str) -> Result<MPD, VodgrabError> {
    check_root_element(xml)?;
    let mut de = quick_xml::de::Deserializer::from_str(xml);
    serde_path_to_error::deserialize::<_, MPD>(&mut de)
        .map_err(|e| VodgrabError::Parsing(format!("{} (at {})", e.inner(), e.path())))
}


/// Returns `true` if this AdaptationSet contains audio content.
///
/// It contains audio if the `contentType` attribute is `audio`, or the `mimeType` attribute is
/// `audio/*`, on the AdaptationSet itself or on one of its Representations.
pub fn is_audio_adaptation(a: &&AdaptationSet) -> bool {
    adaptation_has_kind(a, "audio")
}

/// Returns `true` if this AdaptationSet contains video content.
pub fn is_video_adaptation(a: &&AdaptationSet) -> bool {
    adaptation_has_kind(a, "video")
}

fn adaptation_has_kind(a: &AdaptationSet, kind: &str) -> bool {
    let has_kind = |content_type: &Option<String>, mime_type: &Option<String>| {
        content_type.as_deref() == Some(kind) ||
            mime_type.as_deref()
                .and_then(|m| m.split_once('/'))
                .is_some_and(|(top, _)| top == kind)
    };
    has_kind(&a.contentType, &a.mimeType) ||
        a.representations.iter().any(|r| has_kind(&r.contentType, &r.mimeType))
}

//! Interpretation of a parsed manifest: representation selection and segment URL resolution.
//!
//! This is a pure transformation from an [`MPD`] to one video and one audio [`SelectedTrack`]; no
//! network access happens here.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use regex::{Captures, Regex};
use tracing::{debug, info, warn};
use url::Url;
use crate::{MPD, Period, AdaptationSet, Representation, BaseURL, VodgrabError};
use crate::{SegmentList, SegmentTemplate, SegmentTimeline};
use crate::{parse, parse_error, is_audio_adaptation, is_video_adaptation};


/// Upper bound on the number of media segments of one track. A SegmentTemplate or SegmentTimeline
/// that expands to more segments is rejected as malformed.
pub const MAX_SEGMENTS: u64 = 500_000;

/// The media kind of a selected track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind { Video, Audio }

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// An inclusive byte range within a resource, as written in `@range` and `@mediaRange`
/// attributes ("500-999").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The value of an HTTP `Range` header requesting these bytes.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Parse a range specifier of the form "45-67".
pub(crate) fn parse_range(range: &str) -> Result<ByteRange, VodgrabError> {
    let (start, end) = range.trim().split_once('-')
        .ok_or_else(|| VodgrabError::Parsing(format!("invalid range specifier: {range}")))?;
    let start: u64 = start.parse()
        .map_err(|e| parse_error(&format!("invalid start for range specifier {range}"), e))?;
    let end: u64 = end.parse()
        .map_err(|e| parse_error(&format!("invalid end for range specifier {range}"), e))?;
    if end < start {
        return Err(VodgrabError::Parsing(format!("empty range specifier: {range}")));
    }
    Ok(ByteRange { start, end })
}

/// A fully resolved reference to one segment: an absolute URL, and optionally a byte range within
/// the resource it designates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub url: Url,
    pub range: Option<ByteRange>,
}

/// The Representation selected for one media kind, with its segments in playback order.
#[derive(Debug, Clone)]
pub struct SelectedTrack {
    pub kind: TrackKind,
    pub id: String,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub codecs: Option<String>,
    pub init: SegmentRef,
    pub media: Vec<SegmentRef>,
}

impl SelectedTrack {
    /// The initialization segment followed by the media segments. The position of a segment in
    /// this sequence is the segment index reported by download errors.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentRef> {
        std::iter::once(&self.init).chain(self.media.iter())
    }

    pub fn segment_count(&self) -> usize {
        1 + self.media.len()
    }
}

/// The outcome of manifest interpretation: exactly one video and one audio track.
#[derive(Debug, Clone)]
pub struct SelectedTracks {
    pub video: SelectedTrack,
    pub audio: SelectedTrack,
}


/// Parse the manifest text and select the best video and audio tracks. Relative references are
/// resolved against `manifest_url`, which should be the final (post-redirect) manifest location.
pub fn interpret(xml: &str, manifest_url: &Url) -> Result<SelectedTracks, VodgrabError> {
    let mpd = parse(xml)?;
    select_tracks(&mpd, manifest_url)
}

/// Select the best video and audio Representations of the manifest.
///
/// Video: highest `@height`, then highest `@bandwidth`, then first in document order.
/// Audio: highest `@bandwidth`, then first in document order.
#[tracing::instrument(level = "trace", skip(mpd))]
pub fn select_tracks(mpd: &MPD, manifest_url: &Url) -> Result<SelectedTracks, VodgrabError> {
    if mpd.mpdtype.as_deref() == Some("dynamic") {
        return Err(VodgrabError::Parsing(String::from("dynamic (live) manifests are not supported")));
    }
    let period = mpd.periods.first()
        .ok_or_else(|| VodgrabError::Parsing(String::from("manifest contains no Period")))?;
    if mpd.periods.len() > 1 {
        warn!("Manifest has {} periods, only the first one will be downloaded", mpd.periods.len());
    }
    if let Some(title) = mpd.ProgramInformation.as_ref()
        .and_then(|pi| pi.Title.as_ref())
        .and_then(|t| t.content.as_ref())
    {
        info!("Title: {title}");
    }
    let mpd_base = merge_baseurls(manifest_url, mpd.base_url.first())?;
    let period_base = merge_baseurls(&mpd_base, period.BaseURL.first())?;
    let period_duration = period.duration.or(mpd.mediaPresentationDuration);

    let video_candidates = candidates(period, TrackKind::Video)?;
    let (va, vr) = first_maximum(video_candidates, |c| (c.height.unwrap_or(0), c.bandwidth))
        .map(|c| (c.adaptation, c.representation))
        .ok_or_else(|| VodgrabError::Parsing(String::from("no video Representation in manifest")))?;
    let audio_candidates = candidates(period, TrackKind::Audio)?;
    let (aa, ar) = first_maximum(audio_candidates, |c| c.bandwidth)
        .map(|c| (c.adaptation, c.representation))
        .ok_or_else(|| VodgrabError::Parsing(String::from("no audio Representation in manifest")))?;

    let video = resolve_track(TrackKind::Video, &period_base, va, vr, period_duration)?;
    let audio = resolve_track(TrackKind::Audio, &period_base, aa, ar, period_duration)?;
    info!("Selected video {} ({} bps, {}x{}, codecs {}), {} segments",
          video.id, video.bandwidth,
          video.width.unwrap_or(0), video.height.unwrap_or(0),
          video.codecs.as_deref().unwrap_or("?"),
          video.segment_count());
    info!("Selected audio {} ({} bps, codecs {}), {} segments",
          audio.id, audio.bandwidth,
          audio.codecs.as_deref().unwrap_or("?"),
          audio.segment_count());
    Ok(SelectedTracks { video, audio })
}


struct Candidate<'a> {
    adaptation: &'a AdaptationSet,
    representation: &'a Representation,
    bandwidth: u64,
    height: Option<u64>,
}

// Collect every Representation of the requested kind, in document order, checking that the
// attributes used for ranking are present.
fn candidates(period: &Period, kind: TrackKind) -> Result<Vec<Candidate<'_>>, VodgrabError> {
    let adaptations: Vec<&AdaptationSet> = match kind {
        TrackKind::Video => period.adaptations.iter().filter(is_video_adaptation).collect(),
        TrackKind::Audio => period.adaptations.iter().filter(is_audio_adaptation).collect(),
    };
    if adaptations.is_empty() {
        return Err(VodgrabError::Parsing(format!("manifest has no {kind} AdaptationSet")));
    }
    let mut out = Vec::new();
    for a in adaptations {
        for r in &a.representations {
            let rid = r.id.as_deref().unwrap_or("<unnamed>");
            let bandwidth = r.bandwidth
                .ok_or_else(|| VodgrabError::Parsing(format!(
                    "{kind} Representation {rid} is missing @bandwidth")))?;
            let height = r.height.or(a.height);
            if kind == TrackKind::Video && height.is_none() {
                return Err(VodgrabError::Parsing(format!(
                    "video Representation {rid} is missing @height")));
            }
            out.push(Candidate { adaptation: a, representation: r, bandwidth, height });
        }
    }
    Ok(out)
}

// Like Iterator::max_by_key, but on ties keep the element seen first rather than the last one.
fn first_maximum<T, K: Ord>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> K) -> Option<T> {
    let mut best: Option<(K, T)> = None;
    for item in items {
        let k = key(&item);
        let better = match &best {
            Some((best_key, _)) => k > *best_key,
            None => true,
        };
        if better {
            best = Some((k, item));
        }
    }
    best.map(|(_, item)| item)
}


// Resolve a BaseURL element relative to the enclosing base. An absolute BaseURL replaces the
// enclosing one; an empty one is ignored.
fn merge_baseurls(current: &Url, new: Option<&BaseURL>) -> Result<Url, VodgrabError> {
    match new.map(|bu| bu.base.trim()) {
        Some(base) if !base.is_empty() => current.join(base)
            .map_err(|e| parse_error(&format!("parsing BaseURL {base}"), e)),
        _ => Ok(current.clone()),
    }
}

fn join_reference(base: &Url, reference: &str) -> Result<Url, VodgrabError> {
    base.join(reference.trim())
        .map_err(|e| parse_error(&format!("resolving segment URL {reference}"), e))
}


fn resolve_track(
    kind: TrackKind,
    period_base: &Url,
    adaptation: &AdaptationSet,
    repr: &Representation,
    period_duration: Option<Duration>) -> Result<SelectedTrack, VodgrabError>
{
    let id = repr.id.clone()
        .ok_or_else(|| VodgrabError::Parsing(format!("selected {kind} Representation is missing @id")))?;
    let base = merge_baseurls(period_base, adaptation.BaseURL.first())?;
    let base = merge_baseurls(&base, repr.BaseURL.first())?;
    let mut dict = HashMap::from([("RepresentationID", id.clone())]);
    if let Some(bw) = repr.bandwidth {
        dict.insert("Bandwidth", bw.to_string());
    }
    let (init, media) = if let Some(sl) = repr.SegmentList.as_ref().or(adaptation.SegmentList.as_ref()) {
        debug!("Using SegmentList addressing mode for {kind} representation");
        segment_list_refs(sl, &base, &dict)?
    } else if repr.SegmentTemplate.is_some() || adaptation.SegmentTemplate.is_some() {
        debug!("Using SegmentTemplate addressing mode for {kind} representation");
        let st = merge_templates(adaptation.SegmentTemplate.as_ref(), repr.SegmentTemplate.as_ref());
        segment_template_refs(&st, &base, &dict, period_duration)?
    } else if let Some(sb) = &repr.SegmentBase {
        // The single resource starts with its initialization data and holds every media segment.
        debug!("Using SegmentBase addressing mode for {kind} representation");
        if let Some(range) = sb.initialization.as_ref().and_then(|i| i.range.as_ref()) {
            parse_range(range)?;
        }
        (SegmentRef { url: base, range: None }, Vec::new())
    } else if !repr.BaseURL.is_empty() {
        debug!("Using BaseURL addressing mode for {kind} representation");
        (SegmentRef { url: base, range: None }, Vec::new())
    } else {
        return Err(VodgrabError::Parsing(format!(
            "no usable addressing mode for {kind} Representation {id}")));
    };
    Ok(SelectedTrack {
        kind,
        id,
        bandwidth: repr.bandwidth.unwrap_or(0),
        width: repr.width.or(adaptation.width),
        height: repr.height.or(adaptation.height),
        codecs: repr.codecs.clone().or_else(|| adaptation.codecs.clone()),
        init,
        media,
    })
}

fn segment_list_refs(
    sl: &SegmentList,
    base: &Url,
    dict: &HashMap<&str, String>) -> Result<(SegmentRef, Vec<SegmentRef>), VodgrabError>
{
    let init = sl.Initialization.as_ref()
        .ok_or_else(|| VodgrabError::Parsing(String::from("SegmentList has no Initialization")))?;
    let url = match &init.sourceURL {
        Some(su) => join_reference(base, &resolve_url_template(su, dict))?,
        None => base.clone(),
    };
    let range = init.range.as_deref().map(parse_range).transpose()?;
    let init = SegmentRef { url, range };
    let mut media = Vec::with_capacity(sl.segment_urls.len());
    for su in &sl.segment_urls {
        // a SegmentURL without @media designates a range of the Representation's BaseURL
        let url = match &su.media {
            Some(m) => join_reference(base, m)?,
            None => base.clone(),
        };
        let range = su.mediaRange.as_deref().map(parse_range).transpose()?;
        media.push(SegmentRef { url, range });
    }
    Ok((init, media))
}

// Attributes on the Representation's SegmentTemplate override those inherited from the
// AdaptationSet's.
fn merge_templates(outer: Option<&SegmentTemplate>, inner: Option<&SegmentTemplate>) -> SegmentTemplate {
    let outer = outer.cloned().unwrap_or_default();
    let Some(inner) = inner else {
        return outer;
    };
    SegmentTemplate {
        initialization: inner.initialization.clone().or(outer.initialization),
        media: inner.media.clone().or(outer.media),
        startNumber: inner.startNumber.or(outer.startNumber),
        duration: inner.duration.or(outer.duration),
        timescale: inner.timescale.or(outer.timescale),
        SegmentTimeline: inner.SegmentTimeline.clone().or(outer.SegmentTimeline),
    }
}

fn segment_template_refs(
    st: &SegmentTemplate,
    base: &Url,
    dict: &HashMap<&str, String>,
    period_duration: Option<Duration>) -> Result<(SegmentRef, Vec<SegmentRef>), VodgrabError>
{
    let init = st.initialization.as_ref()
        .ok_or_else(|| VodgrabError::Parsing(String::from("SegmentTemplate is missing @initialization")))?;
    let init = SegmentRef { url: join_reference(base, &resolve_url_template(init, dict))?, range: None };
    let media_template = st.media.as_ref()
        .ok_or_else(|| VodgrabError::Parsing(String::from("SegmentTemplate is missing @media")))?;
    let media_template = resolve_url_template(media_template, dict);
    let timescale = st.timescale.unwrap_or(1).max(1);
    let start_number = st.startNumber.unwrap_or(1);
    let mut media = Vec::new();
    if let Some(timeline) = &st.SegmentTimeline {
        let period_end = period_duration
            .map(|d| (d.as_secs_f64() * timescale as f64).ceil() as u64);
        for (time, number) in timeline_segments(timeline, start_number, period_end)? {
            let vars = HashMap::from([("Time", time.to_string()), ("Number", number.to_string())]);
            let path = resolve_url_template(&media_template, &vars);
            media.push(SegmentRef { url: join_reference(base, &path)?, range: None });
        }
    } else {
        let duration = st.duration
            .filter(|d| *d > 0.0)
            .ok_or_else(|| VodgrabError::Parsing(String::from(
                "SegmentTemplate has neither a SegmentTimeline nor a positive @duration")))?;
        let total = period_duration
            .ok_or_else(|| VodgrabError::Parsing(String::from(
                "SegmentTemplate@duration requires a Period or presentation duration")))?;
        let segment_secs = duration / timescale as f64;
        let count = (total.as_secs_f64() / segment_secs).ceil();
        if !count.is_finite() || count > MAX_SEGMENTS as f64 {
            return Err(VodgrabError::Parsing(format!(
                "SegmentTemplate@duration {duration} yields more than {MAX_SEGMENTS} segments")));
        }
        let end_number = start_number.checked_add(count as u64)
            .ok_or_else(|| VodgrabError::Parsing(String::from("SegmentTemplate@startNumber out of range")))?;
        for number in start_number..end_number {
            let vars = HashMap::from([("Number", number.to_string())]);
            let path = resolve_url_template(&media_template, &vars);
            media.push(SegmentRef { url: join_reference(base, &path)?, range: None });
        }
    }
    Ok((init, media))
}

// Expand a SegmentTimeline into (time, number) pairs. A negative @r repeats the segment until the
// next S@t, or until the end of the Period for the last S element.
fn timeline_segments(
    timeline: &SegmentTimeline,
    start_number: u64,
    period_end: Option<u64>) -> Result<Vec<(u64, u64)>, VodgrabError>
{
    let mut out = Vec::new();
    let mut time = 0;
    let mut number = start_number;
    for (i, s) in timeline.segments.iter().enumerate() {
        if s.d == 0 {
            return Err(VodgrabError::Parsing(String::from("SegmentTimeline S element with zero @d")));
        }
        if let Some(t) = s.t {
            time = t;
        }
        let repeats = match s.r {
            None => 0,
            Some(r) if r >= 0 => r as u64,
            Some(_) => {
                let end = timeline.segments.get(i + 1)
                    .and_then(|next| next.t)
                    .or(period_end)
                    .ok_or_else(|| VodgrabError::Parsing(String::from(
                        "negative S@r without a following S@t or a Period duration")))?;
                end.saturating_sub(time).div_ceil(s.d).saturating_sub(1)
            },
        };
        if repeats >= MAX_SEGMENTS - out.len() as u64 {
            return Err(VodgrabError::Parsing(format!(
                "SegmentTimeline expands to more than {MAX_SEGMENTS} segments")));
        }
        for _ in 0..=repeats {
            out.push((time, number));
            time = time.checked_add(s.d)
                .ok_or_else(|| VodgrabError::Parsing(String::from("SegmentTimeline S@t overflow")))?;
            number = number.checked_add(1)
                .ok_or_else(|| VodgrabError::Parsing(String::from("SegmentTimeline segment number overflow")))?;
        }
    }
    Ok(out)
}


static TEMPLATE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$")
        .expect("compiling URL template regex")
});

// Substitute the identifiers of a SegmentTemplate URL, as per DASH section 5.3.9.4.4. The format
// tag only takes the %0[width]d form; "$$" is an escaped dollar sign. Identifiers with no value in
// `params` are left untouched.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
pub(crate) fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    TEMPLATE_IDENTIFIER.replace_all(template, |caps: &Captures| {
        let Some(name) = caps.get(1) else {
            return String::from("$");
        };
        match params.get(name.as_str()) {
            Some(value) => match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
                Some(width) => format!("{value:0>width$}"),
                None => value.clone(),
            },
            None => caps[0].to_string(),
        }
    }).into_owned()
}

//! Shared pool of outbound streams.
//!
//! A stream is keyed by a label derived from its capture source and option
//! string. The same label is announced as the stream id in session
//! descriptions, so several sessions asking for the same source/options pair
//! share one set of tracks. A stream lives as long as some registered session
//! lists its label; eviction is computed by rescanning session membership.

use crate::error::{Error, Result};
use crate::peer::connection::{MediaTrack, TrackFactory, TrackKind, TrackSpec};
use crate::session::Session;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Characters removed from labels: the label ends up inside SDP.
pub const LABEL_SEPARATORS: [char; 4] = [' ', ':', '.', '/'];

/// Option keys forwarded to the capture layer as video constraints.
pub const VIDEO_CONSTRAINT_KEYS: [&str; 8] = [
    "minWidth",
    "maxWidth",
    "minHeight",
    "maxHeight",
    "minFrameRate",
    "maxFrameRate",
    "minAspectRatio",
    "maxAspectRatio",
];

pub const BITRATE_KEY: &str = "bitrate";

pub fn strip_separators(s: &str) -> String {
    s.chars().filter(|c| !LABEL_SEPARATORS.contains(c)).collect()
}

/// Deterministic stream label for a (source, options) pair.
///
/// Source and options are joined with `|`, which is never stripped, so a
/// source can not bleed into the option string.
pub fn label_for(source_id: &str, options: &str) -> String {
    strip_separators(&format!("{source_id}|{options}"))
}

/// Parsed `key=value&key=value` option string. Unknown keys are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    raw: String,
    values: BTreeMap<String, String>,
}

impl StreamOptions {
    pub fn parse(raw: &str) -> Self {
        let values = raw
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            values,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Target bitrate in bps. An unparseable value is ignored.
    pub fn bitrate(&self) -> Option<u32> {
        let raw = self.get(BITRATE_KEY)?;
        match raw.trim().parse::<u32>() {
            Ok(bps) => Some(bps),
            Err(e) => {
                warn!("ignoring bitrate option {:?}: {}", raw, e);
                None
            }
        }
    }

    /// The subset of options the capture layer understands as constraints.
    pub fn constraints(&self) -> BTreeMap<String, String> {
        VIDEO_CONSTRAINT_KEYS
            .iter()
            .filter_map(|k| self.values.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

/// Capture sources a stream is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub video: String,
    pub audio: Option<String>,
}

impl StreamSource {
    pub fn label(&self, options: &StreamOptions) -> String {
        label_for(&self.video, options.raw())
    }
}

/// One outbound video track and an optional audio track, under one label.
pub struct Stream {
    label: String,
    video_track: Arc<dyn MediaTrack>,
    audio_track: Option<Arc<dyn MediaTrack>>,
    created_at: DateTime<Utc>,
}

pub type StreamHandle = Arc<Stream>;

impl Stream {
    pub fn new(
        label: impl Into<String>,
        video_track: Arc<dyn MediaTrack>,
        audio_track: Option<Arc<dyn MediaTrack>>,
    ) -> Self {
        Self {
            label: label.into(),
            video_track,
            audio_track,
            created_at: Utc::now(),
        }
    }

    /// Asks the capture layer for the tracks of `label`.
    pub fn build(
        label: &str,
        source: &StreamSource,
        options: &StreamOptions,
        tracks: &dyn TrackFactory,
    ) -> Result<Self> {
        let constraints = options.constraints();

        let video_id = strip_separators(&source.video);
        let video = tracks.create_track(&TrackSpec {
            source_id: &source.video,
            kind: TrackKind::Video,
            track_id: &video_id,
            stream_label: label,
            constraints: &constraints,
        })?;

        let audio = match &source.audio {
            Some(audio_source) => {
                let audio_id = strip_separators(&format!("{audio_source}_audio"));
                Some(tracks.create_track(&TrackSpec {
                    source_id: audio_source,
                    kind: TrackKind::Audio,
                    track_id: &audio_id,
                    stream_label: label,
                    constraints: &BTreeMap::new(),
                })?)
            }
            None => None,
        };

        Ok(Self::new(label, video, audio))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn video_track(&self) -> &Arc<dyn MediaTrack> {
        &self.video_track
    }

    pub fn audio_track(&self) -> Option<&Arc<dyn MediaTrack>> {
        self.audio_track.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        std::iter::once(&self.video_track).chain(self.audio_track.iter())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn summary(&self) -> StreamSummary {
        let mut summary = StreamSummary {
            label: self.label.clone(),
            video: Vec::new(),
            audio: Vec::new(),
        };
        for track in self.tracks() {
            match track.kind() {
                TrackKind::Video => summary.video.push(track.id().to_string()),
                TrackKind::Audio => summary.audio.push(track.id().to_string()),
            }
        }
        summary
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.label)
            .field("video_track", &self.video_track.id())
            .field("audio_track", &self.audio_track.as_ref().map(|t| t.id()))
            .finish()
    }
}

/// Track ids attached under one stream label.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub label: String,
    pub video: Vec<String>,
    pub audio: Vec<String>,
}

/// One label's entry. `value` is set once construction succeeds; until then
/// the label counts as absent.
#[derive(Default)]
struct StreamSlot {
    building: Mutex<()>,
    value: OnceLock<StreamHandle>,
    claims: AtomicUsize,
}

/// Holds a slot's claim count up for as long as it lives.
struct SlotClaim(Arc<StreamSlot>);

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.0.claims.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps a stream from being evicted between construction and the caller
/// recording its reference on a session.
pub(crate) struct StreamClaim {
    stream: StreamHandle,
    _claim: SlotClaim,
}

impl StreamClaim {
    pub(crate) fn stream(&self) -> StreamHandle {
        self.stream.clone()
    }
}

/// Label -> stream table.
///
/// Lock order: the session table lock (when held) is taken before the table
/// lock here. The table lock is never held while a stream is built; each
/// label is built under its own slot lock instead.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<StreamSlot>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stream for `label`, building it with `factory` if absent.
    ///
    /// Check, construction and insertion happen under the label's slot lock,
    /// so `factory` runs at most once per label even with racing callers.
    /// Other labels and lookups are not blocked while it runs. A failed
    /// construction leaves the label absent.
    pub fn ensure<F>(&self, label: &str, factory: F) -> Result<StreamHandle>
    where
        F: FnOnce(&str) -> Result<Stream>,
    {
        self.claim(label, factory).map(|claim| claim.stream())
    }

    pub(crate) fn claim<F>(&self, label: &str, factory: F) -> Result<StreamClaim>
    where
        F: FnOnce(&str) -> Result<Stream>,
    {
        let claim = {
            let mut streams = self.streams.lock();
            let slot = streams.entry(label.to_string()).or_default().clone();
            slot.claims.fetch_add(1, Ordering::SeqCst);
            SlotClaim(slot)
        };
        let slot = claim.0.clone();

        let building = slot.building.lock();
        if let Some(existing) = slot.value.get() {
            debug!("reusing stream {}", label);
            return Ok(StreamClaim {
                stream: existing.clone(),
                _claim: claim,
            });
        }

        let stream = match factory(label) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                drop(building);
                self.forget_empty(label, &slot);
                return Err(match e {
                    Error::StreamConstructionFailed(_) => e,
                    other => Error::stream_construction(format!("{label}: {other}")),
                });
            }
        };

        slot.value
            .set(stream.clone())
            .map_err(|_| Error::DuplicateConstruction(label.to_string()))?;
        drop(building);
        info!("stream {} created", label);
        Ok(StreamClaim {
            stream,
            _claim: claim,
        })
    }

    /// Drops a slot whose construction failed, unless another caller is
    /// still working on it.
    fn forget_empty(&self, label: &str, slot: &Arc<StreamSlot>) {
        let mut streams = self.streams.lock();
        if let Entry::Occupied(entry) = streams.entry(label.to_string()) {
            if Arc::ptr_eq(entry.get(), slot)
                && slot.value.get().is_none()
                && slot.claims.load(Ordering::SeqCst) <= 1
            {
                entry.remove();
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<StreamHandle> {
        self.streams
            .lock()
            .get(label)
            .and_then(|slot| slot.value.get().cloned())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.get(label).is_some()
    }

    /// Sorted list of live labels.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .streams
            .lock()
            .iter()
            .filter(|(_, slot)| slot.value.get().is_some())
            .map(|(label, _)| label.clone())
            .collect();
        labels.sort();
        labels
    }

    pub fn len(&self) -> usize {
        self.streams
            .lock()
            .values()
            .filter(|slot| slot.value.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts every stream no session in `sessions` references. Slots still
    /// claimed by an in-progress attach are kept.
    ///
    /// `sessions` must be a consistent snapshot: callers hold the session
    /// table lock across the snapshot and this call.
    pub fn release_unreferenced(&self, sessions: &[Arc<Session>]) -> BTreeSet<String> {
        let mut streams = self.streams.lock();
        let referenced: BTreeSet<String> = sessions
            .iter()
            .flat_map(|s| s.stream_labels())
            .collect();

        let unused: Vec<String> = streams
            .iter()
            .filter(|(label, slot)| {
                !referenced.contains(*label) && slot.claims.load(Ordering::SeqCst) == 0
            })
            .map(|(label, _)| label.clone())
            .collect();

        let mut evicted = BTreeSet::new();
        for label in unused {
            let built = streams
                .remove(&label)
                .is_some_and(|slot| slot.value.get().is_some());
            if built {
                info!("stream {} no longer used, released", label);
                evicted.insert(label);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    struct StubTrack {
        id: String,
        kind: TrackKind,
    }

    impl MediaTrack for StubTrack {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> TrackKind {
            self.kind
        }
    }

    fn stub_stream(label: &str) -> Stream {
        Stream::new(
            label,
            Arc::new(StubTrack {
                id: "cam0".into(),
                kind: TrackKind::Video,
            }),
            None,
        )
    }

    #[test]
    fn label_strips_url_separators() {
        assert_eq!(label_for("rtsp://cam.local/1", "w=1"), "rtspcamlocal1|w=1");
        assert_eq!(label_for("cam 0", ""), "cam0|");
    }

    #[test]
    fn label_is_stable_and_distinguishes_options() {
        assert_eq!(label_for("cam0", "w=640&h=480"), label_for("cam0", "w=640&h=480"));
        assert_ne!(label_for("cam0", "w=640&h=480"), label_for("cam0", "w=320&h=240"));
        assert_ne!(label_for("cam0", "bitrate=1"), label_for("cam0bitrate=1", ""));
        assert_ne!(label_for("cam0", ""), label_for("cam1", ""));
    }

    #[test]
    fn options_keep_unknown_keys() {
        let opts = StreamOptions::parse("bitrate=500000&foo=bar&flag");
        assert_eq!(opts.get("foo"), Some("bar"));
        assert_eq!(opts.get("flag"), Some(""));
        assert_eq!(opts.bitrate(), Some(500_000));
        assert_eq!(opts.raw(), "bitrate=500000&foo=bar&flag");
    }

    #[test]
    fn bad_bitrate_is_ignored() {
        assert_eq!(StreamOptions::parse("bitrate=fast").bitrate(), None);
        assert_eq!(StreamOptions::parse("").bitrate(), None);
    }

    #[test]
    fn constraints_only_forward_known_keys() {
        let opts = StreamOptions::parse("minWidth=320&maxWidth=640&bitrate=1&x=y");
        let c = opts.constraints();
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("minWidth").map(String::as_str), Some("320"));
        assert!(c.get("bitrate").is_none());
    }

    #[test]
    fn ensure_reuses_existing_stream() {
        let registry = StreamRegistry::new();
        let calls = AtomicUsize::new(0);
        let a = registry
            .ensure("s", |l| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(stub_stream(l))
            })
            .unwrap();
        let b = registry
            .ensure("s", |l| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(stub_stream(l))
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_construction_leaves_label_absent() {
        let registry = StreamRegistry::new();
        let err = registry
            .ensure("s", |_| Err(Error::transport("no capture device")))
            .unwrap_err();
        assert!(matches!(err, Error::StreamConstructionFailed(_)));
        assert!(!registry.contains("s"));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_ensure_constructs_once() {
        const CALLERS: usize = 16;
        let registry = Arc::new(StreamRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let registry = registry.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry
                        .ensure("shared", |l| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(stub_stream(l))
                        })
                        .unwrap()
                })
            })
            .collect();

        let streams: Vec<StreamHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(streams.iter().all(|s| Arc::ptr_eq(s, &streams[0])));
    }

    #[test]
    fn release_with_no_sessions_evicts_everything() {
        let registry = StreamRegistry::new();
        registry.ensure("a", |l| Ok(stub_stream(l))).unwrap();
        registry.ensure("b", |l| Ok(stub_stream(l))).unwrap();
        let evicted = registry.release_unreferenced(&[]);
        assert_eq!(evicted.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn slow_construction_does_not_block_other_labels() {
        let registry = Arc::new(StreamRegistry::new());
        registry.ensure("ready", |l| Ok(stub_stream(l))).unwrap();
        let started = Arc::new(Barrier::new(2));

        let builder = {
            let registry = registry.clone();
            let started = started.clone();
            std::thread::spawn(move || {
                registry
                    .ensure("slow", |l| {
                        started.wait();
                        std::thread::sleep(std::time::Duration::from_millis(500));
                        Ok(stub_stream(l))
                    })
                    .unwrap()
            })
        };

        started.wait();
        let t0 = std::time::Instant::now();
        assert!(registry.get("ready").is_some());
        assert!(!registry.contains("slow"));
        assert_eq!(registry.labels(), vec!["ready"]);
        registry.ensure("other", |l| Ok(stub_stream(l))).unwrap();
        assert!(t0.elapsed() < std::time::Duration::from_millis(200));

        builder.join().unwrap();
        assert_eq!(registry.labels(), vec!["other", "ready", "slow"]);
    }

    #[test]
    fn claimed_stream_survives_release() {
        let registry = StreamRegistry::new();
        let claim = registry.claim("held", |l| Ok(stub_stream(l))).unwrap();
        assert!(registry.release_unreferenced(&[]).is_empty());
        assert!(registry.contains("held"));
        drop(claim);
        assert_eq!(registry.release_unreferenced(&[]).len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn summary_lists_track_ids_by_kind() {
        let stream = Stream::new(
            "l",
            Arc::new(StubTrack { id: "v".into(), kind: TrackKind::Video }),
            Some(Arc::new(StubTrack { id: "a_audio".into(), kind: TrackKind::Audio })),
        );
        let s = stream.summary();
        assert_eq!(s.video, vec!["v"]);
        assert_eq!(s.audio, vec!["a_audio"]);
    }
}

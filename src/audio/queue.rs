use rand::{seq::SliceRandom, Rng};
use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::info;

use super::track::Track;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("nothing is playing")]
    NothingPlaying,

    #[error("the queue is full (maximum {0} tracks)")]
    QueueFull(usize),

    /// The voice transport refused the track.
    #[error("audio output failed: {0}")]
    Output(String),
}

/// Lifecycle transitions of one playback context, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    TrackStarted(String),
    TrackEnqueued(String),
    TrackFinished(String),
    TrackSkipped(String),
    VolumeChanged { from: f32, to: f32 },
    PauseChanged(bool),
    LoopChanged(bool),
    Shuffled { tracks: usize },
}

impl fmt::Display for PlaybackNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrackStarted(track) => write!(f, "[Started] {track}"),
            Self::TrackEnqueued(track) => write!(f, "[Enqueued] {track}"),
            Self::TrackFinished(track) => write!(f, "[Finished] {track}"),
            Self::TrackSkipped(track) => write!(f, "[Skipped] {track}"),
            Self::VolumeChanged { from, to } => write!(
                f,
                "[Volume] {} -> {}",
                (from * 100.0).round() as u32,
                (to * 100.0).round() as u32
            ),
            Self::PauseChanged(true) => write!(f, "[Pausing]"),
            Self::PauseChanged(false) => write!(f, "[Resuming]"),
            Self::LoopChanged(true) => write!(f, "[Loop Enabled]"),
            Self::LoopChanged(false) => write!(f, "[Loop Disabled]"),
            Self::Shuffled { tracks } => write!(f, "[Shuffled] {tracks} tracks"),
        }
    }
}

/// Where an enqueued track ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Became the current track
    Started,
    /// 1-based position in the backlog
    Queued(usize),
}

/// Position change on the current track, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    Rewind(u64),
    Forward(u64),
    RewindTo(u64),
    ForwardTo(u64),
}

impl SeekOp {
    /// Negative results clamp to zero; there is no upper clamp.
    pub fn apply(self, elapsed: Duration) -> Duration {
        match self {
            Self::Rewind(ms) => elapsed.saturating_sub(Duration::from_millis(ms)),
            Self::Forward(ms) => elapsed.saturating_add(Duration::from_millis(ms)),
            Self::RewindTo(ms) | Self::ForwardTo(ms) => Duration::from_millis(ms),
        }
    }
}

/// Snapshot for the status command.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub current: Option<String>,
    pub elapsed: Duration,
    pub total: Option<Duration>,
    pub paused: bool,
    pub looping: bool,
    pub volume_percent: u32,
    pub backlog: Vec<String>,
}

/// Playback state machine of one guild.
///
/// Holds at most one current track; the backlog never contains it. Every
/// real transition records a [`PlaybackNotice`]; setting a value to what it
/// already is records nothing.
#[derive(Debug)]
pub struct PlaybackQueue {
    backlog: VecDeque<Track>,
    current: Option<Track>,
    current_serial: u64,
    next_serial: u64,
    paused: bool,
    looping: bool,
    volume: f32,
    max_size: usize,
    notices: Vec<PlaybackNotice>,
}

impl PlaybackQueue {
    pub fn new(volume: f32, max_size: usize) -> Self {
        Self {
            backlog: VecDeque::new(),
            current: None,
            current_serial: 0,
            next_serial: 1,
            paused: false,
            looping: false,
            volume: clamp_volume(volume),
            max_size: max_size.max(1),
            notices: Vec::new(),
        }
    }

    /// Makes the track current when nothing plays, otherwise appends it.
    /// A rejected track is dropped, which kills its decoder.
    pub fn enqueue(&mut self, track: Track) -> Result<Placement, PlaybackError> {
        if self.backlog.len() >= self.max_size {
            return Err(PlaybackError::QueueFull(self.max_size));
        }

        self.notices.push(PlaybackNotice::TrackEnqueued(track.describe()));
        self.backlog.push_back(track);

        if self.current.is_none() {
            self.promote();
            Ok(Placement::Started)
        } else {
            Ok(Placement::Queued(self.backlog.len()))
        }
    }

    /// Discards the current track and promotes the backlog head.
    pub fn skip(&mut self) -> Result<Track, PlaybackError> {
        let mut skipped = self.current.take().ok_or(PlaybackError::NothingPlaying)?;
        info!("⏭️ Skipped: {}", skipped.describe());
        self.notices.push(PlaybackNotice::TrackSkipped(skipped.describe()));
        skipped.release();
        self.promote();
        Ok(skipped)
    }

    /// Handles the end of the track started with `serial`. Returns `false`
    /// for stale events from a track that is no longer current.
    pub fn finish(&mut self, serial: u64) -> bool {
        if self.current.is_none() || serial != self.current_serial {
            return false;
        }

        if let Some(finished) = self.current.take() {
            self.notices.push(PlaybackNotice::TrackFinished(finished.describe()));
            if self.looping {
                self.backlog.push_back(finished.rewound());
            }
        }
        self.promote();
        true
    }

    /// Drops the current track without looping it (it could not be played).
    pub fn discard_current(&mut self) -> Option<Track> {
        let mut discarded = self.current.take()?;
        self.notices.push(PlaybackNotice::TrackFinished(discarded.describe()));
        discarded.release();
        self.promote();
        Some(discarded)
    }

    /// Empties backlog and current. Returns how many tracks were dropped.
    pub fn clear(&mut self) -> usize {
        let mut dropped = self.backlog.len();
        self.backlog.clear();
        if let Some(current) = self.current.take() {
            self.notices.push(PlaybackNotice::TrackSkipped(current.describe()));
            dropped += 1;
        }
        dropped
    }

    pub fn current_mut(&mut self) -> Option<&mut Track> {
        self.current.as_mut()
    }

    /// Serial of the current track; changes every time a track becomes current.
    pub fn current_serial(&self) -> Option<u64> {
        self.current.as_ref().map(|_| self.current_serial)
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.backlog.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool, now: Instant) -> bool {
        if self.paused == paused {
            return false;
        }
        self.paused = paused;
        if let Some(current) = self.current.as_mut() {
            if paused {
                current.clock.pause(now);
            } else {
                current.clock.start(now);
            }
        }
        self.notices.push(PlaybackNotice::PauseChanged(paused));
        true
    }

    /// Starts the clock of the current track once the transport plays it.
    pub fn mark_playing(&mut self, now: Instant) {
        let paused = self.paused;
        if let Some(current) = self.current.as_mut() {
            if !paused {
                current.clock.start(now);
            }
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Clamps to `[0, 1]` and returns the effective volume.
    pub fn set_volume(&mut self, volume: f32) -> f32 {
        let volume = clamp_volume(volume);
        if volume != self.volume {
            self.notices.push(PlaybackNotice::VolumeChanged {
                from: self.volume,
                to: volume,
            });
            self.volume = volume;
        }
        self.volume
    }

    /// Position the current track would have after `op`. Nothing moves
    /// until [`commit_seek`](Self::commit_seek).
    pub fn seek_target(&self, op: SeekOp, now: Instant) -> Result<Duration, PlaybackError> {
        let current = self.current.as_ref().ok_or(PlaybackError::NothingPlaying)?;
        Ok(op.apply(current.clock.elapsed(now)))
    }

    /// Moves the elapsed marker of the current track to `position`.
    pub fn commit_seek(&mut self, position: Duration, now: Instant) -> Result<(), PlaybackError> {
        let current = self.current.as_mut().ok_or(PlaybackError::NothingPlaying)?;
        current.clock.set(position, now);
        Ok(())
    }

    pub fn set_loop(&mut self, looping: bool) -> bool {
        if self.looping == looping {
            return false;
        }
        self.looping = looping;
        self.notices.push(PlaybackNotice::LoopChanged(looping));
        true
    }

    /// Flips loop mode and returns the new state.
    pub fn toggle_loop(&mut self) -> bool {
        self.set_loop(!self.looping);
        self.looping
    }

    /// Uniform permutation of the backlog. The current track is untouched.
    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        self.backlog.make_contiguous().shuffle(rng);
        let tracks = self.backlog.len();
        self.notices.push(PlaybackNotice::Shuffled { tracks });
        tracks
    }

    pub fn shuffle(&mut self) -> usize {
        self.shuffle_with(&mut rand::thread_rng())
    }

    pub fn status(&self, now: Instant) -> QueueStatus {
        QueueStatus {
            current: self.current.as_ref().map(Track::describe),
            elapsed: self
                .current
                .as_ref()
                .map(|t| t.clock.elapsed(now))
                .unwrap_or_default(),
            total: self.current.as_ref().and_then(Track::duration),
            paused: self.paused,
            looping: self.looping,
            volume_percent: (self.volume * 100.0).round() as u32,
            backlog: self.backlog.iter().map(Track::describe).collect(),
        }
    }

    /// Drains recorded notices in transition order.
    pub fn take_notices(&mut self) -> Vec<PlaybackNotice> {
        std::mem::take(&mut self.notices)
    }

    fn promote(&mut self) {
        if let Some(next) = self.backlog.pop_front() {
            self.current_serial = self.next_serial;
            self.next_serial += 1;
            self.notices.push(PlaybackNotice::TrackStarted(next.describe()));
            self.current = Some(next);
        }
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::TrackRequest;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn track(id: &str) -> Track {
        Track::unloaded(TrackRequest::media(id), None)
    }

    impl PlaybackQueue {
        fn current(&self) -> Option<&Track> {
            self.current.as_ref()
        }

        fn backlog(&self) -> impl Iterator<Item = &Track> {
            self.backlog.iter()
        }

        fn seek(&mut self, op: SeekOp, now: Instant) -> Result<Duration, PlaybackError> {
            let position = self.seek_target(op, now)?;
            self.commit_seek(position, now)?;
            Ok(position)
        }
    }

    fn names(queue: &PlaybackQueue) -> Vec<String> {
        queue.backlog().map(|t| t.request.source.clone()).collect()
    }

    fn current(queue: &PlaybackQueue) -> Option<String> {
        queue.current().map(|t| t.request.source.clone())
    }

    #[test]
    fn enqueue_then_skip_keeps_fifo_order() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        assert_eq!(queue.enqueue(track("A")), Ok(Placement::Started));
        assert_eq!(queue.enqueue(track("B")), Ok(Placement::Queued(1)));
        assert_eq!(queue.enqueue(track("C")), Ok(Placement::Queued(2)));

        assert_eq!(current(&queue).as_deref(), Some("A"));
        assert_eq!(names(&queue), vec!["B", "C"]);

        let skipped = queue.skip().unwrap();
        assert_eq!(skipped.request.source, "A");
        assert_eq!(current(&queue).as_deref(), Some("B"));
        assert_eq!(names(&queue), vec!["C"]);
    }

    #[test]
    fn skip_with_nothing_playing_fails() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        assert_eq!(queue.skip().unwrap_err(), PlaybackError::NothingPlaying);

        queue.enqueue(track("A")).unwrap();
        queue.skip().unwrap();
        assert!(queue.is_idle());
        assert!(queue.current_serial().is_none());
    }

    #[test]
    fn notices_follow_transition_order() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        queue.enqueue(track("A")).unwrap();
        queue.enqueue(track("B")).unwrap();
        let serial = queue.current_serial().unwrap();
        queue.finish(serial);
        queue.skip().unwrap();

        assert_eq!(
            queue.take_notices(),
            vec![
                PlaybackNotice::TrackEnqueued("A".into()),
                PlaybackNotice::TrackStarted("A".into()),
                PlaybackNotice::TrackEnqueued("B".into()),
                PlaybackNotice::TrackFinished("A".into()),
                PlaybackNotice::TrackStarted("B".into()),
                PlaybackNotice::TrackSkipped("B".into()),
            ]
        );
        assert!(queue.take_notices().is_empty());
    }

    #[test]
    fn unchanged_values_emit_nothing() {
        let now = Instant::now();
        let mut queue = PlaybackQueue::new(0.2, 10);
        assert!(!queue.set_paused(false, now));
        assert!(!queue.set_loop(false));
        queue.set_volume(0.2);
        assert!(queue.take_notices().is_empty());

        assert!(queue.set_paused(true, now));
        assert!(queue.toggle_loop());
        queue.set_volume(0.5);
        assert_eq!(
            queue.take_notices(),
            vec![
                PlaybackNotice::PauseChanged(true),
                PlaybackNotice::LoopChanged(true),
                PlaybackNotice::VolumeChanged { from: 0.2, to: 0.5 },
            ]
        );
    }

    #[test]
    fn volume_is_clamped() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        assert_eq!(queue.set_volume(1.5), 1.0);
        assert_eq!(queue.set_volume(-0.1), 0.0);
        assert_eq!(queue.set_volume(f32::NAN), 0.0);
        assert_eq!(queue.set_volume(0.35), 0.35);
        assert_eq!(PlaybackQueue::new(7.0, 1).volume(), 1.0);
    }

    #[test]
    fn shuffle_is_a_permutation_of_the_backlog() {
        let mut queue = PlaybackQueue::new(0.2, 100);
        for id in ["now", "a", "b", "c", "d", "e", "f", "g", "h"] {
            queue.enqueue(track(id)).unwrap();
        }
        let before = names(&queue);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(queue.shuffle_with(&mut rng), 8);
            let mut after = names(&queue);
            assert_eq!(current(&queue).as_deref(), Some("now"));
            after.sort();
            assert_eq!(after, before);
        }
    }

    #[test]
    fn loop_requeues_finished_track_at_tail() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        queue.enqueue(track("A")).unwrap();
        queue.enqueue(track("B")).unwrap();
        queue.set_loop(true);

        let serial = queue.current_serial().unwrap();
        assert!(queue.finish(serial));
        assert_eq!(current(&queue).as_deref(), Some("B"));
        assert_eq!(names(&queue), vec!["A"]);
        assert!(!queue.backlog().next().unwrap().has_stream());
    }

    #[test]
    fn stale_end_events_are_ignored() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        queue.enqueue(track("A")).unwrap();
        queue.enqueue(track("B")).unwrap();
        let first = queue.current_serial().unwrap();
        queue.skip().unwrap();

        assert!(!queue.finish(first));
        assert_eq!(current(&queue).as_deref(), Some("B"));

        let second = queue.current_serial().unwrap();
        assert_ne!(first, second);
        assert!(queue.finish(second));
        assert!(queue.is_idle());
    }

    #[test]
    fn queue_full_rejects_track() {
        let mut queue = PlaybackQueue::new(0.2, 2);
        queue.enqueue(track("A")).unwrap();
        queue.enqueue(track("B")).unwrap();
        queue.enqueue(track("C")).unwrap();
        assert_eq!(queue.enqueue(track("D")), Err(PlaybackError::QueueFull(2)));
        assert_eq!(names(&queue), vec!["B", "C"]);
    }

    #[test]
    fn seek_clamps_at_zero_but_not_above() {
        let t0 = Instant::now();
        let mut queue = PlaybackQueue::new(0.2, 10);
        assert_eq!(
            queue.seek(SeekOp::Forward(1000), t0),
            Err(PlaybackError::NothingPlaying)
        );

        queue.enqueue(track("A")).unwrap();
        queue.mark_playing(t0);
        let later = t0 + Duration::from_secs(10);

        assert_eq!(queue.seek(SeekOp::Rewind(60_000), later), Ok(Duration::ZERO));
        assert_eq!(
            queue.seek(SeekOp::ForwardTo(10_000_000), later),
            Ok(Duration::from_secs(10_000))
        );
        assert_eq!(
            queue.seek(SeekOp::Rewind(4000), later),
            Ok(Duration::from_secs(9996))
        );
        assert_eq!(queue.seek(SeekOp::RewindTo(1500), later), Ok(Duration::from_millis(1500)));
    }

    #[test]
    fn seek_target_leaves_the_clock_alone() {
        let t0 = Instant::now();
        let mut queue = PlaybackQueue::new(0.2, 10);
        queue.enqueue(track("A")).unwrap();
        queue.mark_playing(t0);
        let later = t0 + Duration::from_secs(10);

        assert_eq!(queue.seek_target(SeekOp::Forward(5000), later), Ok(Duration::from_secs(15)));
        assert_eq!(queue.status(later).elapsed, Duration::from_secs(10));

        queue.commit_seek(Duration::from_secs(3), later).unwrap();
        assert_eq!(queue.status(later).elapsed, Duration::from_secs(3));
    }

    #[test]
    fn paused_clock_does_not_advance() {
        let t0 = Instant::now();
        let mut queue = PlaybackQueue::new(0.2, 10);
        queue.enqueue(track("A")).unwrap();
        queue.mark_playing(t0);
        queue.set_paused(true, t0 + Duration::from_secs(2));

        let status = queue.status(t0 + Duration::from_secs(30));
        assert_eq!(status.elapsed, Duration::from_secs(2));
        assert!(status.paused);
        assert_eq!(status.volume_percent, 20);
        assert_eq!(status.current.as_deref(), Some("A"));
    }

    #[test]
    fn clear_drops_everything() {
        let mut queue = PlaybackQueue::new(0.2, 10);
        queue.enqueue(track("A")).unwrap();
        queue.enqueue(track("B")).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_idle());
    }
}

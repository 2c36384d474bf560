use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{BeatReelError, Result};

/// Stable identity of one continuous audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// Already-decoded mono PCM that the graph plays back.
#[derive(Clone)]
pub struct AudioSource {
    id: SourceId,
    sample_rate: u32,
    samples: Arc<[f32]>,
}

impl AudioSource {
    pub fn new(id: SourceId, sample_rate: u32, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            id,
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Averages interleaved channels down to mono.
    pub fn from_interleaved(
        id: SourceId,
        sample_rate: u32,
        channels: u16,
        interleaved: &[f32],
    ) -> Result<Self> {
        if channels == 0 {
            return Err(BeatReelError::InvalidInput(
                "audio source needs at least one channel",
            ));
        }
        let channels = channels as usize;
        let mono: Vec<f32> = interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok(Self::new(id, sample_rate, mono))
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .field("samples", &self.samples.len())
            .finish()
    }
}

/// Identity of a node created inside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// Typed view of the wiring produced by [`SharedAudioGraph::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphHandle {
    context: u32,
    source_id: SourceId,
    source_node: NodeId,
    destination_node: NodeId,
    sample_rate: u32,
}

impl GraphHandle {
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn source_node(&self) -> NodeId {
        self.source_node
    }

    pub fn destination_node(&self) -> NodeId {
        self.destination_node
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Uninitialized,
    Ready,
    Closed,
}

/// Audible sink connected to the source alongside the capture destination.
pub trait AudioOutput: Send {
    fn write(&mut self, samples: &[f32]);
}

/// Output that discards everything; used for offline rendering.
#[derive(Debug, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn write(&mut self, _samples: &[f32]) {}
}

/// Rolling window of the most recent samples, read by the analysis engine.
#[derive(Clone)]
pub struct AnalysisNode {
    id: NodeId,
    capacity: usize,
    window: Arc<Mutex<VecDeque<f32>>>,
}

impl AnalysisNode {
    fn new(id: NodeId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            window: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies the newest `out.len()` samples into `out`, zero-filling the front
    /// when fewer samples have arrived.
    pub fn snapshot(&self, out: &mut [f32]) -> Result<()> {
        let window = lock(&self.window, "analysis window")?;
        out.fill(0.0);
        let take = window.len().min(out.len());
        let skip = window.len() - take;
        let offset = out.len() - take;
        for (slot, sample) in out[offset..].iter_mut().zip(window.iter().skip(skip)) {
            *slot = *sample;
        }
        Ok(())
    }

    fn push(&self, samples: &[f32]) -> Result<()> {
        let mut window = lock(&self.window, "analysis window")?;
        for &sample in samples {
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(sample);
        }
        Ok(())
    }
}

impl fmt::Debug for AnalysisNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisNode")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Capturable stream fed by the graph's destination node.
#[derive(Clone)]
pub struct CaptureTap {
    sample_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
}

impl CaptureTap {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Takes every sample delivered since the previous drain.
    pub fn drain(&self) -> Result<Vec<f32>> {
        let mut buffer = lock(&self.buffer, "capture tap")?;
        Ok(std::mem::take(&mut *buffer))
    }

    /// Puts undelivered samples back in front of anything newer.
    pub(crate) fn requeue(&self, samples: Vec<f32>) -> Result<()> {
        let mut buffer = lock(&self.buffer, "capture tap")?;
        let newer = std::mem::replace(&mut *buffer, samples);
        buffer.extend(newer);
        Ok(())
    }

    fn push(&self, samples: &[f32]) -> Result<()> {
        let mut buffer = lock(&self.buffer, "capture tap")?;
        buffer.extend_from_slice(samples);
        Ok(())
    }
}

impl fmt::Debug for CaptureTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureTap")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

struct Wiring {
    handle: GraphHandle,
    source: AudioSource,
    position: usize,
    destination: CaptureTap,
    taps: Vec<AnalysisNode>,
}

enum Inner {
    Uninitialized,
    Ready(Box<Wiring>),
    Closed,
}

/// Owns the one-time wiring of an audio source to the main output, the
/// capture destination and any analysis taps.
///
/// The graph moves through `Uninitialized -> Ready -> Closed`. A source can
/// be bound to an element-source node once for the lifetime of the graph.
pub struct SharedAudioGraph {
    inner: Inner,
    output: Box<dyn AudioOutput>,
    spectral_analysis: bool,
    bound_sources: HashSet<SourceId>,
    next_node: u32,
    contexts: u32,
}

impl SharedAudioGraph {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            inner: Inner::Uninitialized,
            output,
            spectral_analysis: true,
            bound_sources: HashSet::new(),
            next_node: 0,
            contexts: 0,
        }
    }

    /// Graph whose host offers no frequency analyser.
    pub fn without_spectral_analysis(output: Box<dyn AudioOutput>) -> Self {
        Self {
            spectral_analysis: false,
            ..Self::new(output)
        }
    }

    pub fn state(&self) -> GraphState {
        match self.inner {
            Inner::Uninitialized => GraphState::Uninitialized,
            Inner::Ready(_) => GraphState::Ready,
            Inner::Closed => GraphState::Closed,
        }
    }

    /// Returns the wiring for `source`, building it on first use.
    ///
    /// Repeated calls with the same source return the same node identities
    /// without touching the connections.
    pub fn acquire(&mut self, source: &AudioSource) -> Result<GraphHandle> {
        match &self.inner {
            Inner::Ready(wiring) if wiring.handle.source_id == source.id() => {
                return Ok(wiring.handle.clone());
            }
            Inner::Ready(wiring) => {
                return Err(BeatReelError::graph(format!(
                    "graph is already wired to source {:?}",
                    wiring.handle.source_id
                )));
            }
            Inner::Closed => {
                return Err(BeatReelError::graph("audio context has been closed"));
            }
            Inner::Uninitialized => {}
        }

        if self.bound_sources.contains(&source.id()) {
            return Err(BeatReelError::graph(format!(
                "source {:?} already owns an element-source node",
                source.id()
            )));
        }
        if source.sample_rate() == 0 {
            return Err(BeatReelError::InvalidInput(
                "audio source sample rate must be non-zero",
            ));
        }

        self.contexts += 1;
        let source_node = self.allocate_node();
        let destination_node = self.allocate_node();
        let handle = GraphHandle {
            context: self.contexts,
            source_id: source.id(),
            source_node,
            destination_node,
            sample_rate: source.sample_rate(),
        };

        self.bound_sources.insert(source.id());
        self.inner = Inner::Ready(Box::new(Wiring {
            handle: handle.clone(),
            source: source.clone(),
            position: 0,
            destination: CaptureTap::new(source.sample_rate()),
            taps: Vec::new(),
        }));
        tracing::info!(source = ?source.id(), sample_rate = source.sample_rate(), "audio graph wired");
        Ok(handle)
    }

    /// Connects a fresh analysis node to the shared source.
    ///
    /// Each call adds one more branch; callers should tap once per handle.
    pub fn tap_analysis(&mut self, handle: &GraphHandle, window: usize) -> Result<AnalysisNode> {
        if !self.spectral_analysis {
            return Err(BeatReelError::AudioUnsupported);
        }
        if window == 0 {
            return Err(BeatReelError::InvalidInput(
                "analysis window must be non-zero",
            ));
        }
        let id = self.allocate_node();
        let wiring = self.wiring_for(handle)?;
        let node = AnalysisNode::new(id, window);
        wiring.taps.push(node.clone());
        if wiring.taps.len() > 1 {
            tracing::warn!(
                taps = wiring.taps.len(),
                "multiple analysis taps share one audio source"
            );
        }
        Ok(node)
    }

    /// Stream delivered to the capture destination.
    pub fn capture_stream(&mut self, handle: &GraphHandle) -> Result<CaptureTap> {
        Ok(self.wiring_for(handle)?.destination.clone())
    }

    /// Plays the next `frames` samples through every connection. Returns the
    /// number of samples delivered, zero once the source is exhausted or the
    /// graph is not ready.
    pub fn pump(&mut self, frames: usize) -> Result<usize> {
        let Inner::Ready(wiring) = &mut self.inner else {
            return Ok(0);
        };
        let start = wiring.position.min(wiring.source.len());
        let end = (start + frames).min(wiring.source.len());
        if start == end {
            return Ok(0);
        }

        let chunk = &wiring.source.samples[start..end];
        wiring.destination.push(chunk)?;
        self.output.write(chunk);
        for tap in &wiring.taps {
            tap.push(chunk)?;
        }
        wiring.position = end;
        Ok(end - start)
    }

    /// Samples played so far.
    pub fn position(&self) -> usize {
        match &self.inner {
            Inner::Ready(wiring) => wiring.position,
            _ => 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match &self.inner {
            Inner::Ready(wiring) => wiring.position >= wiring.source.len(),
            _ => true,
        }
    }

    /// Source to destination, source to main output, plus one per analysis tap.
    pub fn connection_count(&self) -> usize {
        match &self.inner {
            Inner::Ready(wiring) => 2 + wiring.taps.len(),
            _ => 0,
        }
    }

    pub fn analysis_tap_count(&self) -> usize {
        match &self.inner {
            Inner::Ready(wiring) => wiring.taps.len(),
            _ => 0,
        }
    }

    /// Disconnects the source and closes the context. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Ready(wiring) => {
                tracing::info!(
                    source = ?wiring.handle.source_id,
                    context = wiring.handle.context,
                    "audio graph closed"
                );
            }
            Inner::Uninitialized => self.inner = Inner::Uninitialized,
            Inner::Closed => {}
        }
    }

    fn wiring_for(&mut self, handle: &GraphHandle) -> Result<&mut Wiring> {
        match &mut self.inner {
            Inner::Ready(wiring) if wiring.handle == *handle => Ok(&mut **wiring),
            Inner::Ready(_) => Err(BeatReelError::graph("handle belongs to another wiring")),
            Inner::Uninitialized => Err(BeatReelError::graph("audio graph is not initialised")),
            Inner::Closed => Err(BeatReelError::graph("audio context has been closed")),
        }
    }

    fn allocate_node(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node)
    }
}

impl fmt::Debug for SharedAudioGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAudioGraph")
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .field("spectral_analysis", &self.spectral_analysis)
            .finish()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| BeatReelError::msg(format!("{what} has been poisoned")))
}

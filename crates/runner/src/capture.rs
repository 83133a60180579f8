use std::sync::{Arc, Mutex, MutexGuard};

use crate::observer::{Observer, ObserverId, Registered};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Buffers {
    banner: String,
    stdout: Vec<String>,
    stderr: Vec<String>,
    stdout_observers: Vec<Registered>,
    stderr_observers: Vec<Registered>,
}

impl Buffers {
    fn lines_mut(&mut self, stream: Stream) -> &mut Vec<String> {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    fn observers_mut(&mut self, stream: Stream) -> &mut Vec<Registered> {
        match stream {
            Stream::Stdout => &mut self.stdout_observers,
            Stream::Stderr => &mut self.stderr_observers,
        }
    }
}

/// Output captured by the current (or last) run plus the attached
/// observers. Appending and broadcasting happen under one lock so an
/// observer never misses or repeats a chunk across its replay.
#[derive(Default)]
pub(crate) struct Capture {
    inner: Mutex<Buffers>,
}

pub(crate) enum Pushed {
    Stored,
    OverLimit,
}

impl Capture {
    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin(&self, banner: String) {
        let mut buffers = self.lock();
        buffers.stdout.clear();
        buffers.stderr.clear();
        for registered in &buffers.stdout_observers {
            registered.observer.write(&format!("\n{banner}"));
        }
        buffers.banner = banner;
    }

    /// Stores `chunk` unless `max_lines` (0 = unlimited) has been reached.
    pub(crate) fn push(&self, stream: Stream, chunk: String, max_lines: usize) -> Pushed {
        let mut buffers = self.lock();
        let total = buffers.stdout.len() + buffers.stderr.len();
        if max_lines > 0 && total >= max_lines {
            return Pushed::OverLimit;
        }
        for registered in buffers.observers_mut(stream).iter() {
            registered.observer.write(&chunk);
        }
        buffers.lines_mut(stream).push(chunk);
        Pushed::Stored
    }

    pub(crate) fn lines(&self) -> (Vec<String>, Vec<String>) {
        let buffers = self.lock();
        (buffers.stdout.clone(), buffers.stderr.clone())
    }

    pub(crate) fn clear(&self) {
        let mut buffers = self.lock();
        buffers.banner.clear();
        buffers.stdout.clear();
        buffers.stderr.clear();
    }

    pub(crate) fn register(&self, stream: Stream, observer: Arc<dyn Observer>) -> ObserverId {
        let mut buffers = self.lock();
        if stream == Stream::Stdout && !buffers.banner.is_empty() {
            observer.write(&buffers.banner);
        }
        for line in buffers.lines_mut(stream).iter() {
            observer.write(line);
        }
        let id = ObserverId::next();
        buffers
            .observers_mut(stream)
            .push(Registered { id, observer });
        id
    }

    pub(crate) fn release(&self, stream: Stream, id: ObserverId) {
        let mut buffers = self.lock();
        buffers
            .observers_mut(stream)
            .retain(|registered| registered.id != id);
    }
}

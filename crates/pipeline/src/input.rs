use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputKind {
    PointerMove { x: f32, y: f32 },
    PointerDown { pointer: u32, x: f32, y: f32 },
    PointerUp { pointer: u32, x: f32, y: f32 },
    Scroll { dx: f32, dy: f32 },
    Key { code: u32, pressed: bool },
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub kind: InputKind,
    /// Microseconds on the pipeline clock.
    pub timestamp: u64,
}

/// Buffers window input between ticks and tracks pressed pointers, which
/// count as an active interaction.
#[derive(Debug, Default)]
pub struct InputDispatcher {
    queued: VecDeque<InputEvent>,
    pressed: BTreeSet<u32>,
}

impl InputDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: InputEvent) {
        match event.kind {
            InputKind::PointerDown { pointer, .. } => {
                self.pressed.insert(pointer);
            }
            InputKind::PointerUp { pointer, .. } => {
                self.pressed.remove(&pointer);
            }
            InputKind::Cancel => self.pressed.clear(),
            _ => {}
        }
        self.queued.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<InputEvent> {
        self.queued.drain(..).collect()
    }

    pub fn has_active_pointers(&self) -> bool {
        !self.pressed.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    pub fn clear(&mut self) {
        self.queued.clear();
        self.pressed.clear();
    }
}

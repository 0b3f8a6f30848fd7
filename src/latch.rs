//! Handshake channels between pipeline stages.

use crate::Error;

/// Single-slot channel between two adjacent pipeline stages.
///
/// The producer may only push while the slot is empty and the consumer has not
/// raised its wait signal. Popping transfers ownership of the payload to the
/// consumer and frees the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Latch<T> {
    name: String,
    payload: Option<T>,
    wait: bool,
}

impl<T> Latch<T> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
            wait: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.payload.is_some()
    }

    #[must_use]
    pub fn ready_for_push(&self) -> bool {
        self.payload.is_none() && !self.wait
    }

    /// Pushes `payload` if the latch is ready.
    ///
    /// On backpressure the payload is handed back unchanged so the caller can
    /// stall and retry next cycle.
    pub fn push(&mut self, payload: T) -> Result<(), T> {
        if !self.ready_for_push() {
            return Err(payload);
        }
        self.payload = Some(payload);
        Ok(())
    }

    /// Pushes `payload`, treating backpressure as a protocol violation.
    pub fn push_or_fail(&mut self, payload: T, stage: &str, cycle: u64) -> Result<(), Error> {
        self.push(payload).map_err(|_| Error::LatchOccupied {
            stage: stage.to_string(),
            latch: self.name.clone(),
            cycle,
        })
    }

    pub fn pop(&mut self) -> Option<T> {
        self.payload.take()
    }

    /// Pops the payload, treating an empty slot as a protocol violation.
    pub fn pop_or_fail(&mut self, stage: &str, cycle: u64) -> Result<T, Error> {
        self.payload.take().ok_or_else(|| Error::LatchEmpty {
            stage: stage.to_string(),
            latch: self.name.clone(),
            cycle,
        })
    }

    #[must_use]
    pub fn snoop(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn snoop_mut(&mut self) -> Option<&mut T> {
        self.payload.as_mut()
    }

    /// Consumer side stall signal. A waiting latch refuses pushes even when empty.
    pub fn set_wait(&mut self, wait: bool) {
        self.wait = wait;
    }
}

impl<T> std::fmt::Display for Latch<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{}[{}]", self.name, payload),
            None => write!(f, "{}[ ]", self.name),
        }
    }
}

/// Side-band signal between non-adjacent stages.
///
/// Unlike a [`Latch`], a push never fails: the latest value wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingIf<T> {
    name: String,
    payload: Option<T>,
}

impl<T> ForwardingIf<T> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `payload`, replacing a value nobody picked up.
    pub fn push(&mut self, payload: T) {
        self.payload = Some(payload);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.payload.take()
    }

    #[must_use]
    pub fn snoop(&self) -> Option<&T> {
        self.payload.as_ref()
    }

}

impl<T> ForwardingIf<Vec<T>> {
    /// Accumulates `item` into the pending signal.
    pub fn append(&mut self, item: T) {
        self.payload.get_or_insert_with(Vec::new).push(item);
    }
}

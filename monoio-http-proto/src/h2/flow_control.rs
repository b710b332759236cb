//! HTTP/2 flow control window tracking (RFC 7540 Section 6.9).

/// Default initial window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: i64 = 65535;
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// A send or receive window. Can go negative after a SETTINGS change.
#[derive(Debug, Clone)]
pub struct FlowControl {
    window: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowError;

impl FlowControl {
    pub fn new(initial: i64) -> Self {
        Self { window: initial }
    }

    #[inline]
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now.
    #[inline]
    pub fn available(&self) -> u32 {
        self.window.clamp(0, MAX_WINDOW_SIZE) as u32
    }

    pub fn consume(&mut self, amount: u32) -> Result<(), WindowError> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(WindowError);
        }
        self.window = new;
        Ok(())
    }

    pub fn increase(&mut self, increment: u32) -> Result<(), WindowError> {
        let new = self.window + i64::from(increment);
        if new > MAX_WINDOW_SIZE {
            return Err(WindowError);
        }
        self.window = new;
        Ok(())
    }

    /// `delta` is the change of SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowError> {
        let new = self.window + delta;
        if new > MAX_WINDOW_SIZE {
            return Err(WindowError);
        }
        self.window = new;
        Ok(())
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

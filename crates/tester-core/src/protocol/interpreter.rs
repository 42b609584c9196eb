//! Dispatch of decoded messages to per-kind handler slots.
//!
//! A device session registers the handlers it cares about; messages of a kind
//! with no registered handler are dropped silently.

use tracing::{debug, warn};

use crate::domain::board::VoltageLevel;
use crate::protocol::codec::{decode_next, DecodeError, FrameBuffer};
use crate::protocol::messages::{
    ConnectionsDescription, ControllerMessage, HardwareDescription, InternalParameters,
};

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

/// Per-kind handler table.
#[derive(Default)]
pub struct ResponseInterpreter {
    on_connections_description: Option<Handler<ConnectionsDescription>>,
    on_hardware_description: Option<Handler<HardwareDescription>>,
    on_internal_parameters: Option<Handler<InternalParameters>>,
    on_selected_voltage_level: Option<Handler<VoltageLevel>>,
}

impl std::fmt::Debug for ResponseInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseInterpreter")
            .field("on_connections_description", &self.on_connections_description.is_some())
            .field("on_hardware_description", &self.on_hardware_description.is_some())
            .field("on_internal_parameters", &self.on_internal_parameters.is_some())
            .field("on_selected_voltage_level", &self.on_selected_voltage_level.is_some())
            .finish()
    }
}

impl ResponseInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connections_description(
        mut self,
        handler: impl Fn(ConnectionsDescription) + Send + Sync + 'static,
    ) -> Self {
        self.on_connections_description = Some(Box::new(handler));
        self
    }

    pub fn on_hardware_description(
        mut self,
        handler: impl Fn(HardwareDescription) + Send + Sync + 'static,
    ) -> Self {
        self.on_hardware_description = Some(Box::new(handler));
        self
    }

    pub fn on_internal_parameters(
        mut self,
        handler: impl Fn(InternalParameters) + Send + Sync + 'static,
    ) -> Self {
        self.on_internal_parameters = Some(Box::new(handler));
        self
    }

    pub fn on_selected_voltage_level(
        mut self,
        handler: impl Fn(VoltageLevel) + Send + Sync + 'static,
    ) -> Self {
        self.on_selected_voltage_level = Some(Box::new(handler));
        self
    }

    /// Hands `message` to its slot.  Returns `false` when the slot is empty.
    pub fn dispatch(&self, message: ControllerMessage) -> bool {
        match message {
            ControllerMessage::ConnectionsDescription(m) => deliver(&self.on_connections_description, m),
            ControllerMessage::HardwareDescription(m) => deliver(&self.on_hardware_description, m),
            ControllerMessage::InternalParameters(m) => deliver(&self.on_internal_parameters, m),
            ControllerMessage::SelectedVoltageLevel(m) => deliver(&self.on_selected_voltage_level, m),
        }
    }

    /// Decodes and dispatches every complete frame in `text`.
    ///
    /// Unhealthy frames are logged and skipped.  Returns the text after the
    /// last complete frame.
    pub fn handle_text<'a>(&self, text: &'a str) -> &'a str {
        let mut remainder = text;
        while let Some((result, rest)) = decode_next(remainder) {
            self.handle_result(result);
            remainder = rest;
        }
        remainder
    }

    /// Appends `bytes` to `buffer` and dispatches every frame it completes.
    /// Returns the number of frames decoded successfully.
    pub fn feed(&self, buffer: &mut FrameBuffer, bytes: &[u8]) -> usize {
        buffer.push(bytes);
        buffer
            .drain()
            .into_iter()
            .map(|result| self.handle_result(result))
            .filter(|decoded| *decoded)
            .count()
    }

    fn handle_result(&self, result: Result<ControllerMessage, DecodeError>) -> bool {
        match result {
            Ok(message) => {
                let kind = message.kind();
                if !self.dispatch(message) {
                    debug!(kind, "no handler registered, message dropped");
                }
                true
            }
            Err(e) => {
                warn!("discarding unhealthy frame: {e}");
                false
            }
        }
    }
}

fn deliver<T>(slot: &Option<Handler<T>>, message: T) -> bool {
    match slot {
        Some(handler) => {
            handler(message);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_dispatch_reaches_registered_slot_only() {
        // Arrange
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let interpreter = ResponseInterpreter::new()
            .on_hardware_description(move |hw| sink.lock().unwrap().push(hw.boards_online));

        // Act
        let remainder = interpreter.handle_text("CONNECT 1:1 -> 1:1 END HW 2 -> 3 4 END HW");

        // Assert
        assert_eq!(*seen.lock().unwrap(), vec![vec![3, 4]]);
        assert_eq!(remainder, " HW");
    }

    #[test]
    fn test_dispatch_reports_empty_slot() {
        let interpreter = ResponseInterpreter::new();
        assert!(!interpreter.dispatch(ControllerMessage::SelectedVoltageLevel(VoltageLevel::High)));
    }

    #[test]
    fn test_feed_counts_decoded_frames_and_skips_bad_ones() {
        // Arrange
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let interpreter =
            ResponseInterpreter::new().on_connections_description(move |_| *sink.lock().unwrap() += 1);
        let mut buffer = FrameBuffer::new();

        // Act
        let first = interpreter.feed(&mut buffer, b"CONNECT 1:1 -> 1:1 END CONNECT 0:0 END CONN");
        let second = interpreter.feed(&mut buffer, b"ECT 2:2 -> 2:2 END");

        // Assert
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(*count.lock().unwrap(), 2);
    }
}

//! Lifecycle tests for `SerialTransport`
//!
//! Covers construction ordering, the read path, graceful close, abort,
//! fatal device errors and teardown, all driven by a `ManualLoop`.

mod common;

use common::{Event, Harness, HANDLE};
use serial_transport::config::TransportConfig;
use serial_transport::device::{DeviceError, MockDevice};
use serial_transport::transport::ExtraInfo;
use serial_transport::{ManualLoop, TransportError};
use std::io;
use std::time::Duration;

fn broken_pipe() -> DeviceError {
    io::Error::from(io::ErrorKind::BrokenPipe).into()
}

// ============================================================================
// Construction
// ============================================================================

mod construction_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_transport::device::Device;

    #[test]
    fn test_callbacks_run_after_constructor_returns() {
        // Arrange
        let h = Harness::new();

        // Assert: nothing fired synchronously
        assert!(h.protocol.events().is_empty());
        assert!(!h.lp.has_reader(HANDLE));
        assert!(!h.transport.is_closing());

        // Act
        h.lp.run_until_idle();

        // Assert: connection_made, then reading
        assert_eq!(h.protocol.events(), vec![Event::Made]);
        assert!(h.lp.has_reader(HANDLE));
        assert!(h.transport.is_reading());
    }

    #[test]
    fn test_device_is_made_non_blocking() {
        let h = Harness::new();
        assert_eq!(h.device.timeouts(), Some((Duration::ZERO, Duration::ZERO)));
    }

    #[test]
    fn test_invalid_limits_in_config_fail_construction() {
        let config = TransportConfig {
            high_water: Some(1),
            low_water: Some(2),
            ..TransportConfig::default()
        };
        let lp = std::rc::Rc::new(ManualLoop::new());
        let result = serial_transport::SerialTransport::with_config(
            lp,
            common::RecordingProtocol::new(),
            Box::new(MockDevice::new("MOCK0")),
            &config,
        );
        assert!(matches!(
            result,
            Err(TransportError::InvalidWriteBufferLimits { high: 1, low: 2 })
        ));
    }

    #[test]
    fn test_zero_poll_interval_fails_construction() {
        let config = TransportConfig {
            poll_interval_us: 0,
            ..TransportConfig::default()
        };

        for lp in [ManualLoop::polling(), ManualLoop::new()] {
            let lp = std::rc::Rc::new(lp);
            let result = serial_transport::SerialTransport::with_config(
                lp.clone(),
                common::RecordingProtocol::new(),
                Box::new(MockDevice::without_handle("MOCK0")),
                &config,
            );

            assert!(matches!(result, Err(TransportError::ZeroPollInterval)));
            assert_eq!(lp.pending_timers(), 0);
            // Nothing was scheduled, so the clock can move.
            lp.advance(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_identity_and_extra_info() {
        let h = Harness::new().started();

        assert_eq!(h.transport.name(), "MOCK0");
        assert!(h.transport.event_loop().is_some());
        match h.transport.extra_info("serial") {
            Some(ExtraInfo::Serial(device)) => assert_eq!(device.lock().name(), "MOCK0"),
            other => panic!("unexpected extra info: {:?}", other),
        }
        assert!(h.transport.extra_info("peername").is_none());
        assert!(h.transport.extra_info("sockname").is_none());
        assert!(!h.transport.can_write_eof());
        assert!(matches!(
            h.transport.write_eof(),
            Err(TransportError::EofNotSupported)
        ));
    }
}

// ============================================================================
// Read path
// ============================================================================

mod read_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_readable_event_delivers_data() {
        let h = Harness::new().started();
        h.device.enqueue_read(b"hello");

        assert!(h.readable());

        assert_eq!(
            h.protocol.events(),
            vec![Event::Made, Event::Data(b"hello".to_vec())]
        );
    }

    #[test]
    fn test_empty_read_is_ignored() {
        let h = Harness::new().started();

        h.readable();

        assert_eq!(h.protocol.events(), vec![Event::Made]);
        assert!(!h.transport.is_closing());
    }

    #[test]
    fn test_reads_are_bounded_by_chunk_size() {
        let config = TransportConfig {
            read_chunk_size: 4,
            ..TransportConfig::default()
        };
        let h = Harness::with_config(&config).started();
        h.device.enqueue_read(b"abcdefghij");

        h.readable();
        assert_eq!(h.protocol.received(), b"abcd");
        h.readable();
        h.readable();
        assert_eq!(h.protocol.received(), b"abcdefghij");
    }

    #[test]
    fn test_pause_and_resume_reading() {
        let h = Harness::new().started();

        h.transport.pause_reading();
        assert!(!h.lp.has_reader(HANDLE));
        assert!(!h.transport.is_reading());

        h.transport.resume_reading();
        assert!(h.lp.has_reader(HANDLE));

        h.transport.close();
        h.transport.resume_reading();
        assert!(!h.lp.has_reader(HANDLE));
    }

    #[test]
    fn test_transient_read_error_is_ignored() {
        let h = Harness::new().started();
        h.device
            .fail_next_read(io::Error::from(io::ErrorKind::WouldBlock).into());

        h.readable();

        assert!(!h.transport.is_closing());
        assert!(h.exception_messages().is_empty());
    }

    #[test]
    fn test_end_of_stream_closes_gracefully() {
        // Arrange: data still waiting to go out when the peer hangs up
        let h = Harness::new().started();
        h.device.set_write_capacity(Some(0));
        h.transport.write(b"bye");
        h.device.fail_next_read(DeviceError::EndOfStream);

        // Act
        h.readable();

        // Assert: closing without a report, pending data still drains
        assert!(h.transport.is_closing());
        assert!(!h.lp.has_reader(HANDLE));
        assert!(h.exception_messages().is_empty());
        assert_eq!(h.protocol.losses(), 0);

        h.device.set_write_capacity(None);
        h.writable();

        assert_eq!(h.device.written(), b"bye");
        assert_eq!(h.protocol.events().last(), Some(&Event::Lost(None)));
        assert!(h.device.is_closed());
    }

    #[test]
    fn test_read_error_is_fatal() {
        // Arrange
        let h = Harness::new().started();
        h.device.fail_next_read(DeviceError::config("framing error"));

        // Act
        h.readable();

        // Assert: reported, then aborted with the same error
        assert_eq!(
            h.exception_messages(),
            vec!["Fatal read error on serial transport".to_string()]
        );
        assert_eq!(
            h.protocol.events().last(),
            Some(&Event::Lost(Some("Configuration error: framing error".to_string())))
        );
        assert!(h.device.is_closed());
        assert!(!h.lp.has_reader(HANDLE));
    }
}

// ============================================================================
// Close and abort
// ============================================================================

mod close_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_close_with_empty_buffer() {
        // Arrange
        let h = Harness::new().started();

        // Act
        h.transport.close();
        assert!(h.transport.is_closing());
        assert_eq!(h.protocol.losses(), 0, "connection_lost must be deferred");
        h.lp.run_until_idle();

        // Assert
        assert_eq!(h.protocol.events(), vec![Event::Made, Event::Lost(None)]);
        assert!(h.device.is_closed());
        assert_eq!(h.device.flush_count(), 1);
        assert_eq!(h.device.write_calls(), 0);
        assert!(h.transport.serial().is_none());
        assert!(h.transport.event_loop().is_none());
        assert!(h.transport.extra_info("serial").is_none());
        assert!(h.transport.is_closing());
    }

    #[test]
    fn test_close_drains_pending_data_first() {
        // Arrange: a device that accepts nothing yet
        let h = Harness::new().started();
        h.device.set_write_capacity(Some(0));
        h.transport.write(b"first ");
        h.transport.write(b"second");

        // Act
        h.transport.close();
        h.lp.run_until_idle();
        assert_eq!(h.protocol.losses(), 0);
        assert!(!h.lp.has_reader(HANDLE));
        assert!(h.lp.has_writer(HANDLE));

        h.writable();
        assert_eq!(h.transport.get_write_buffer_size(), 12);

        h.device.set_write_capacity(None);
        h.writable();

        // Assert: nothing lost, then connection_lost(None)
        assert_eq!(h.device.written(), b"first second");
        assert_eq!(h.protocol.events().last(), Some(&Event::Lost(None)));
        assert!(h.device.is_closed());
        assert!(!h.lp.has_writer(HANDLE));
    }

    #[test]
    fn test_close_is_idempotent() {
        let h = Harness::new().started();

        h.transport.close();
        h.transport.close();
        h.lp.run_until_idle();
        h.transport.close();
        h.lp.run_until_idle();

        assert_eq!(h.protocol.losses(), 1);
    }

    #[test]
    fn test_abort_discards_pending_data() {
        // Arrange
        let h = Harness::new().started();
        h.device.set_write_capacity(Some(0));
        h.transport.write(b"never sent");
        assert!(h.lp.has_writer(HANDLE));

        // Act
        h.transport.abort_with(TransportError::from(broken_pipe()));
        h.lp.run_until_idle();

        // Assert
        assert_eq!(h.transport.get_write_buffer_size(), 0);
        assert!(!h.lp.has_reader(HANDLE));
        assert!(!h.lp.has_writer(HANDLE));
        assert!(h.device.written().is_empty());
        assert_eq!(h.protocol.losses(), 1);
        assert_eq!(
            h.protocol.lost_error().map(|e| e.to_string()),
            Some("I/O error: broken pipe".to_string())
        );
    }

    #[test]
    fn test_abort_after_close_with_pending_data() {
        let h = Harness::new().started();
        h.device.set_write_capacity(Some(0));
        h.transport.write(b"stuck");
        h.transport.close();

        h.transport.abort();
        h.lp.run_until_idle();

        assert_eq!(h.protocol.events().last(), Some(&Event::Lost(None)));
        assert_eq!(h.protocol.losses(), 1);
        assert!(h.device.is_closed());
    }

    #[test]
    fn test_flush_while_closing_finishes_close() {
        let h = Harness::new().started();
        h.device.set_write_capacity(Some(0));
        h.transport.write(b"stuck");
        h.transport.close();
        h.lp.run_until_idle();
        assert_eq!(h.protocol.losses(), 0);

        h.transport.flush();
        h.lp.run_until_idle();

        assert_eq!(h.protocol.losses(), 1);
        assert!(h.device.written().is_empty());
    }

    #[test]
    fn test_writes_after_close_or_abort_are_ignored() {
        let h = Harness::new().started();
        h.transport.close();
        h.transport.write(b"late");
        assert_eq!(h.transport.get_write_buffer_size(), 0);
        assert!(!h.lp.has_writer(HANDLE));
        h.lp.run_until_idle();
        h.transport.write(b"later");

        let aborted = Harness::new().started();
        aborted.transport.abort();
        aborted.transport.write(b"late");
        aborted.lp.run_until_idle();

        for harness in [&h, &aborted] {
            assert_eq!(harness.transport.get_write_buffer_size(), 0);
            assert_eq!(harness.device.write_calls(), 0);
        }
    }

    #[test]
    fn test_operations_after_teardown_are_ignored() {
        let h = Harness::new().started();
        h.transport.close();
        h.lp.run_until_idle();

        h.transport.pause_reading();
        h.transport.resume_reading();
        h.transport.flush();
        h.transport.abort();
        h.transport.close();
        h.lp.run_until_idle();

        assert_eq!(h.protocol.losses(), 1);
        assert!(h.exception_messages().is_empty());
    }
}

// ============================================================================
// Teardown
// ============================================================================

mod teardown_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flush_error_from_vanished_device_is_ignored() {
        let h = Harness::new().started();
        h.device.fail_flush(broken_pipe());

        h.transport.close();
        h.lp.run_until_idle();

        assert!(h.exception_messages().is_empty());
        assert_eq!(h.protocol.events().last(), Some(&Event::Lost(None)));
        assert!(h.device.is_closed());
    }

    #[test]
    fn test_other_flush_errors_are_reported() {
        let h = Harness::new().started();
        h.device.fail_flush(DeviceError::config("driver wedged"));

        h.transport.close();
        h.lp.run_until_idle();

        assert_eq!(
            h.exception_messages(),
            vec!["Failed to flush serial device during close".to_string()]
        );
        assert_eq!(h.protocol.losses(), 1);
        assert!(h.device.is_closed());
    }

    #[test]
    fn test_cleanup_runs_when_connection_lost_panics() {
        // Arrange
        let h = Harness::new().started();
        h.protocol.panic_on_lost.set(true);
        h.device.set_write_capacity(Some(0));
        h.transport.write(b"pending");

        // Act
        h.transport.abort();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| h.lp.run_until_idle()));

        // Assert: the panic surfaces, but teardown still completed
        assert!(outcome.is_err());
        assert!(h.device.is_closed());
        assert_eq!(h.transport.get_write_buffer_size(), 0);
        assert!(h.transport.serial().is_none());
        assert!(h.transport.event_loop().is_none());
    }

    #[test]
    fn test_write_error_is_fatal() {
        let h = Harness::new().started();
        h.device.fail_next_write(broken_pipe());
        h.transport.write(b"doomed");

        h.writable();

        assert_eq!(
            h.exception_messages(),
            vec!["Fatal write error on serial transport".to_string()]
        );
        assert_eq!(
            h.protocol.events().last(),
            Some(&Event::Lost(Some("I/O error: broken pipe".to_string())))
        );
        assert!(!h.lp.has_writer(HANDLE));
    }
}

// ============================================================================
// Polling strategy
// ============================================================================

mod polling_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TICK: Duration = Duration::from_micros(500);

    #[test]
    fn test_polling_reads() {
        let h = Harness::polling().started();
        assert!(h.transport.is_reading());
        assert!(!h.lp.has_reader(HANDLE));

        h.device.enqueue_read(b"ping");
        h.lp.advance(TICK);

        assert_eq!(h.protocol.received(), b"ping");
    }

    #[test]
    fn test_polling_write_waits_for_out_queue() {
        // Arrange: driver reports a full output queue
        let h = Harness::polling().started();
        h.device.set_out_waiting(4096);
        h.transport.write(b"queued");

        // Act
        h.lp.advance(TICK * 4);
        assert!(h.device.written().is_empty());

        h.device.set_out_waiting(0);
        h.lp.advance(TICK);

        // Assert
        assert_eq!(h.device.written(), b"queued");
        assert_eq!(h.transport.get_write_buffer_size(), 0);
    }

    #[test]
    fn test_polling_close_drains_before_teardown() {
        let h = Harness::polling().started();
        h.device.set_write_capacity(Some(2));
        h.transport.write(b"abcdef");
        h.transport.close();

        h.lp.advance(TICK * 10);

        assert_eq!(h.device.written(), b"abcdef");
        assert_eq!(h.protocol.events().last(), Some(&Event::Lost(None)));
        assert!(!h.transport.is_reading());
    }

    #[test]
    fn test_polling_timers_stop_after_teardown() {
        let h = Harness::polling().started();
        h.transport.close();
        h.lp.advance(TICK * 4);

        h.lp.advance(TICK * 4);
        assert_eq!(h.lp.pending_timers(), 0);
        assert_eq!(h.protocol.losses(), 1);
    }
}

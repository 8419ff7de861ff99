//! Fan-out of one byte stream to two sinks
//!
//! The generating path of a channel writes every chunk of a fresh thumbnail
//! both to the listener and to the cache write entry. The two consumers fail
//! independently: a sink that fails is skipped from then on while the other
//! keeps receiving.

use crate::errors::SinkError;

/// Synchronous consumer of bytes
pub trait ByteSink: Send {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError>;
}

impl ByteSink for Vec<u8> {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

impl<S: ByteSink + ?Sized> ByteSink for &mut S {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        (**self).write_all(chunk)
    }
}

/// Cumulative result of writing through a [`TeeWriter`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeeReport {
    /// Bytes offered to the tee
    pub bytes_in: usize,
    /// Bytes the primary sink accepted
    pub primary_bytes: usize,
    /// Bytes the secondary sink accepted
    pub secondary_bytes: usize,
    /// First failure of the primary sink, after which it was skipped
    pub primary_error: Option<SinkError>,
    /// First failure of the secondary sink, after which it was skipped
    pub secondary_error: Option<SinkError>,
}

impl TeeReport {
    pub fn primary_ok(&self) -> bool {
        self.primary_error.is_none()
    }
}

/// Writes every chunk to a primary and a secondary sink
pub struct TeeWriter<P, S> {
    primary: P,
    secondary: S,
    report: TeeReport,
}

impl<P: ByteSink, S: ByteSink> TeeWriter<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self {
            primary,
            secondary,
            report: TeeReport::default(),
        }
    }

    /// Write one chunk to every sink that has not failed yet
    pub fn write(&mut self, chunk: &[u8]) -> &TeeReport {
        self.report.bytes_in += chunk.len();

        if self.report.primary_error.is_none() {
            match self.primary.write_all(chunk) {
                Ok(()) => self.report.primary_bytes += chunk.len(),
                Err(e) => self.report.primary_error = Some(e),
            }
        }

        if self.report.secondary_error.is_none() {
            match self.secondary.write_all(chunk) {
                Ok(()) => self.report.secondary_bytes += chunk.len(),
                Err(e) => self.report.secondary_error = Some(e),
            }
        }

        &self.report
    }

    pub fn into_parts(self) -> (P, S, TeeReport) {
        (self.primary, self.secondary, self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink {
        accept: usize,
        received: Vec<u8>,
    }

    impl ByteSink for FailingSink {
        fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
            if self.accept == 0 {
                return Err(SinkError::Write {
                    message: "disk full".to_string(),
                });
            }
            self.accept -= 1;
            self.received.extend_from_slice(chunk);
            Ok(())
        }
    }

    #[test]
    fn test_tee_writes_both_sinks() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut writer = TeeWriter::new(&mut a, &mut b);
        writer.write(b"thumb");
        writer.write(b"nail");
        let (_, _, report) = writer.into_parts();

        assert!(report.primary_ok());
        assert_eq!(report.secondary_error, None);
        assert_eq!(report.bytes_in, 9);
        assert_eq!(a, b"thumbnail");
        assert_eq!(b, b"thumbnail");
    }

    #[test]
    fn test_failed_secondary_is_skipped_primary_continues() {
        let mut primary = Vec::new();
        let mut secondary = FailingSink {
            accept: 1,
            received: Vec::new(),
        };

        let mut writer = TeeWriter::new(&mut primary, &mut secondary);
        writer.write(b"ab");
        writer.write(b"cd");
        writer.write(b"ef");
        let (_, _, report) = writer.into_parts();

        assert_eq!(primary, b"abcdef");
        assert_eq!(secondary.received, b"ab");
        assert!(report.primary_ok());
        assert_eq!(report.secondary_bytes, 2);
        assert_eq!(
            report.secondary_error,
            Some(SinkError::Write {
                message: "disk full".to_string()
            })
        );
    }

    #[test]
    fn test_failed_primary_is_skipped_secondary_continues() {
        let mut primary = FailingSink {
            accept: 0,
            received: Vec::new(),
        };
        let mut secondary = Vec::new();

        let mut writer = TeeWriter::new(&mut primary, &mut secondary);
        writer.write(b"12");
        let report = writer.write(b"34").clone();
        drop(writer);

        assert!(!report.primary_ok());
        assert_eq!(report.primary_bytes, 0);
        assert_eq!(secondary, b"1234");
    }
}

use crate::detect::Protocol;
use std::fmt::Write;

pub const CONFIDENCE_HIGH: u8 = 90;
pub const CONFIDENCE_MEDIUM: u8 = 70;
pub const CONFIDENCE_LOW: u8 = 50;

const CALIBRATION_MIN: f64 = 0.5;
const CALIBRATION_MAX: f64 = 1.5;

/// Running per-protocol accuracy bookkeeping fed by external outcome
/// reports.
#[derive(Debug, Clone)]
pub struct AccuracyRecord {
    pub total: u64,
    pub correct: u64,
    pub false_pos: u64,
    pub false_neg: u64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confidence_adjustment: f64,
}

impl Default for AccuracyRecord {
    fn default() -> AccuracyRecord {
        AccuracyRecord {
            total: 0,
            correct: 0,
            false_pos: 0,
            false_neg: 0,
            accuracy: 0.0,
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
            confidence_adjustment: 1.0,
        }
    }
}

impl AccuracyRecord {
    fn recompute(&mut self) {
        if self.total > 0 {
            self.accuracy = self.correct as f64 / self.total as f64;
        }

        let predicted = self.correct + self.false_pos;
        self.precision = match predicted {
            0 => 0.0,
            _ => self.correct as f64 / predicted as f64,
        };

        let actual = self.correct + self.false_neg;
        self.recall = match actual {
            0 => 0.0,
            _ => self.correct as f64 / actual as f64,
        };

        self.f1 = match self.precision + self.recall > 0.0 {
            true => 2.0 * self.precision * self.recall / (self.precision + self.recall),
            _ => 0.0,
        };
    }
}

#[derive(Debug, Copy, Clone)]
struct HistoryEntry {
    predicted: f64,
    actual: f64,
}

/// Aggregate detection statistics plus the adaptive confidence
/// calibration state.
pub struct DetectionStats {
    pub total_packets: u64,
    pub identified_packets: u64,
    protocol_counts: [u64; Protocol::COUNT],
    high_confidence: u64,
    medium_confidence: u64,
    low_confidence: u64,
    floor_confidence: u64,
    accuracy: [AccuracyRecord; Protocol::COUNT],
    history: Vec<HistoryEntry>,
    history_cap: usize,
    history_pos: usize,
    calibration_factor: f64,
}

impl DetectionStats {
    pub fn new(history_cap: usize) -> DetectionStats {
        DetectionStats {
            total_packets: 0,
            identified_packets: 0,
            protocol_counts: [0; Protocol::COUNT],
            high_confidence: 0,
            medium_confidence: 0,
            low_confidence: 0,
            floor_confidence: 0,
            accuracy: Default::default(),
            history: Vec::with_capacity(history_cap),
            history_cap,
            history_pos: 0,
            calibration_factor: 1.0,
        }
    }

    /// Account one classified packet.
    pub fn record_packet(&mut self, protocol: Protocol, confidence: u8) {
        self.total_packets += 1;

        if protocol == Protocol::Unknown {
            return;
        }

        self.identified_packets += 1;
        self.protocol_counts[protocol.index()] += 1;

        if confidence >= CONFIDENCE_HIGH {
            self.high_confidence += 1;
        } else if confidence >= CONFIDENCE_MEDIUM {
            self.medium_confidence += 1;
        } else if confidence >= CONFIDENCE_LOW {
            self.low_confidence += 1;
        } else {
            self.floor_confidence += 1;
        }
    }

    /// Historical accuracy rate used by the confidence model. Protocols
    /// without feedback yet sit at the neutral prior.
    #[inline]
    pub fn historical_accuracy(&self, protocol: Protocol) -> f64 {
        let record = &self.accuracy[protocol.index()];

        match record.total {
            0 => 0.7,
            _ => record.accuracy,
        }
    }

    #[inline]
    pub fn accuracy_record(&self, protocol: Protocol) -> &AccuracyRecord {
        &self.accuracy[protocol.index()]
    }

    #[inline]
    pub fn calibration_factor(&self) -> f64 {
        self.calibration_factor
    }

    /// External feedback for a prediction made on `protocol`.
    pub fn record_outcome(&mut self, protocol: Protocol, predicted: u8, actual: u8, was_correct: bool) {
        let record = &mut self.accuracy[protocol.index()];

        record.total += 1;
        match was_correct {
            true => record.correct += 1,
            _ => record.false_pos += 1,
        }

        let delta = (f64::from(predicted) - f64::from(actual)).abs();
        record.confidence_adjustment = 1.0 - (delta / 100.0) * 0.1;
        record.recompute();

        self.push_history(HistoryEntry {
            predicted: f64::from(predicted) / 100.0,
            actual: f64::from(actual) / 100.0,
        });
    }

    /// Report that traffic of `protocol` went undetected; feeds the recall
    /// side of the accuracy record.
    pub fn record_missed(&mut self, protocol: Protocol) {
        let record = &mut self.accuracy[protocol.index()];
        record.false_neg += 1;
        record.recompute();
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        if self.history_cap == 0 {
            return;
        }

        if self.history.len() < self.history_cap {
            self.history.push(entry);
        } else {
            self.history[self.history_pos] = entry;
        }

        self.history_pos = (self.history_pos + 1) % self.history_cap;
    }

    /// Recalibrate the confidence scale from the accumulated error
    /// history. Called periodically; a no-op while the history is empty.
    pub fn calibrate(&mut self) -> f64 {
        if !self.history.is_empty() {
            let total: f64 = self
                .history
                .iter()
                .map(|e| (e.predicted - e.actual).abs())
                .sum();
            let avg_error = total / self.history.len() as f64;

            if avg_error > 0.20 {
                self.calibration_factor *= 0.95;
            } else if avg_error < 0.10 {
                self.calibration_factor *= 1.05;
            }

            self.calibration_factor = self
                .calibration_factor
                .max(CALIBRATION_MIN)
                .min(CALIBRATION_MAX);
        }

        self.calibration_factor
    }

    /// Renders the statistics table logged on the periodic tick.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        writeln!(
            out,
            "packets total={} identified={} ({:.1}%)",
            self.total_packets,
            self.identified_packets,
            match self.total_packets {
                0 => 0.0,
                total => self.identified_packets as f64 * 100.0 / total as f64,
            }
        )
        .unwrap();

        writeln!(
            out,
            "confidence high={} medium={} low={} floor={} calibration={:.3}",
            self.high_confidence,
            self.medium_confidence,
            self.low_confidence,
            self.floor_confidence,
            self.calibration_factor
        )
        .unwrap();

        for protocol in Protocol::ALL.iter().filter(|p| **p != Protocol::Unknown) {
            let record = &self.accuracy[protocol.index()];
            writeln!(
                out,
                "{:<8} count={} acc={:.2} prec={:.2} rec={:.2} f1={:.2}",
                protocol.name(),
                self.protocol_counts[protocol.index()],
                record.accuracy,
                record.precision,
                record.recall,
                record.f1
            )
            .unwrap();
        }

        out
    }
}

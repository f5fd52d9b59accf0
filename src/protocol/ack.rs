//! Acknowledgement window for received transactions.
//!
//! The server keeps at most `max_unacked` transactions in flight. The
//! client acknowledges once `max_unacked * threshold_percent / 100`
//! transactions (at least one) have been applied, whenever a periodic
//! timer fires with something new to report, and immediately for
//! additional data, delivered subscriptions and gone batches.

use chrono::Utc;

use super::messages::SatOpLogAck;
use crate::types::Lsn;

#[derive(Debug, Clone)]
pub struct AckWindow {
    max_unacked: u32,
    threshold_percent: u32,
    unacked: u32,
    last_acked_tx_id: Option<u64>,
    last_seen_lsn: Lsn,
    last_seen_tx_id: Option<u64>,
    pending_subscriptions: Vec<String>,
    pending_additional: Vec<u64>,
    pending_gone: Vec<String>,
}

impl AckWindow {
    pub fn new(max_unacked: u32, threshold_percent: u32) -> Self {
        Self {
            max_unacked,
            threshold_percent,
            unacked: 0,
            last_acked_tx_id: None,
            last_seen_lsn: Lsn::default(),
            last_seen_tx_id: None,
            pending_subscriptions: Vec::new(),
            pending_additional: Vec::new(),
            pending_gone: Vec::new(),
        }
    }

    /// The server may announce its own window size on replication start.
    pub fn set_max_unacked(&mut self, max_unacked: u32) {
        self.max_unacked = max_unacked;
    }

    pub fn threshold(&self) -> u32 {
        (self.max_unacked.saturating_mul(self.threshold_percent) / 100).max(1)
    }

    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    /// A transaction was applied. Transactions without a server id are
    /// not counted.
    pub fn transaction_applied(&mut self, lsn: Lsn, transaction_id: Option<u64>) -> Option<SatOpLogAck> {
        let id = transaction_id?;
        self.last_seen_lsn = lsn;
        self.last_seen_tx_id = Some(id);
        self.unacked += 1;
        crate::metrics::set_unacked_transactions(self.unacked);
        if self.unacked >= self.threshold() {
            self.make_ack()
        } else {
            None
        }
    }

    pub fn additional_data_applied(&mut self, reference: u64) -> Option<SatOpLogAck> {
        self.pending_additional.push(reference);
        self.make_ack()
    }

    pub fn subscription_data_applied(&mut self, subscription_id: String, lsn: Lsn) -> Option<SatOpLogAck> {
        self.pending_subscriptions.push(subscription_id);
        if !lsn.is_empty() && lsn > self.last_seen_lsn {
            self.last_seen_lsn = lsn;
        }
        self.make_ack()
    }

    pub fn gone_batch_applied(&mut self, subscription_ids: Vec<String>) -> Option<SatOpLogAck> {
        self.pending_gone.extend(subscription_ids);
        self.make_ack()
    }

    /// Periodic flush.
    pub fn timer_fired(&mut self) -> Option<SatOpLogAck> {
        self.make_ack()
    }

    fn has_news(&self) -> bool {
        self.last_seen_tx_id != self.last_acked_tx_id
            || !self.pending_subscriptions.is_empty()
            || !self.pending_additional.is_empty()
            || !self.pending_gone.is_empty()
    }

    fn make_ack(&mut self) -> Option<SatOpLogAck> {
        if !self.has_news() {
            return None;
        }

        let ack = SatOpLogAck {
            ack_timestamp: now_millis(),
            lsn: self.last_seen_lsn.as_bytes().to_vec(),
            transaction_id: self.last_seen_tx_id.unwrap_or(0),
            subscription_ids: std::mem::take(&mut self.pending_subscriptions),
            additional_data_source_ids: std::mem::take(&mut self.pending_additional),
            gone_subscription_ids: std::mem::take(&mut self.pending_gone),
        };
        self.unacked = 0;
        self.last_acked_tx_id = self.last_seen_tx_id;
        crate::metrics::set_unacked_transactions(0);
        Some(ack)
    }

    /// Forget progress, e.g. after the replication stream restarted.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_unacked, self.threshold_percent);
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert_eq!(AckWindow::new(30, 70).threshold(), 21);
        assert_eq!(AckWindow::new(1, 70).threshold(), 1);
        assert_eq!(AckWindow::new(0, 70).threshold(), 1);
        assert_eq!(AckWindow::new(10, 100).threshold(), 10);
    }

    #[test]
    fn test_acks_once_at_threshold() {
        let mut window = AckWindow::new(30, 70);
        let mut acks = Vec::new();
        for id in 1..=21u64 {
            if let Some(ack) = window.transaction_applied(Lsn::from_rowid(id as i64), Some(id)) {
                acks.push((id, ack));
            }
        }
        assert_eq!(acks.len(), 1);
        let (at, ack) = &acks[0];
        assert_eq!(*at, 21);
        assert_eq!(ack.transaction_id, 21);
        assert_eq!(ack.lsn, Lsn::from_rowid(21).as_bytes());
        assert_eq!(window.unacked(), 0);

        // Nothing new since.
        assert!(window.timer_fired().is_none());
    }

    #[test]
    fn test_timer_flushes_partial_window() {
        let mut window = AckWindow::new(30, 70);
        assert!(window.transaction_applied(Lsn::from_rowid(1), Some(7)).is_none());
        let before = Utc::now().timestamp_millis() as u64;
        let ack = window.timer_fired().unwrap();
        assert_eq!(ack.transaction_id, 7);
        assert!(ack.ack_timestamp >= before);
        assert!(ack.ack_timestamp <= Utc::now().timestamp_millis() as u64);
        assert!(window.timer_fired().is_none());
    }

    #[test]
    fn test_transactions_without_id_are_not_counted() {
        let mut window = AckWindow::new(1, 100);
        assert!(window.transaction_applied(Lsn::from_rowid(1), None).is_none());
        assert_eq!(window.unacked(), 0);
        assert!(window.timer_fired().is_none());
    }

    #[test]
    fn test_side_channels_ack_immediately() {
        let mut window = AckWindow::new(30, 70);
        let ack = window.additional_data_applied(9).unwrap();
        assert_eq!(ack.additional_data_source_ids, vec![9]);

        let ack = window
            .subscription_data_applied("sub".into(), Lsn::from_rowid(4))
            .unwrap();
        assert_eq!(ack.subscription_ids, vec!["sub"]);
        assert_eq!(ack.lsn, Lsn::from_rowid(4).as_bytes());
        assert!(ack.additional_data_source_ids.is_empty());

        let ack = window.gone_batch_applied(vec!["old".into()]).unwrap();
        assert_eq!(ack.gone_subscription_ids, vec!["old"]);
        assert!(window.timer_fired().is_none());
    }

    #[test]
    fn test_server_window_size() {
        let mut window = AckWindow::new(30, 70);
        window.set_max_unacked(2);
        assert!(window.transaction_applied(Lsn::from_rowid(1), Some(1)).is_some());
        window.reset();
        assert_eq!(window.threshold(), 1);
    }
}

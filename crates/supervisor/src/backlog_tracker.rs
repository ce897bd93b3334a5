use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use ingest_core::{
    config::BacklogConfig,
    models::{Alert, AlertKind, AlertLevel, BacklogSample},
};

/// 一次采样的判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum BacklogObservation {
    /// 积压在变化，或样本不足以判断
    Progressing,
    /// 积压首次降为 0（每次清空只报告一次）
    Drained,
    /// 积压仍为 0
    Idle,
    /// 新的停滞周期开始
    Stalled(Alert),
    /// 停滞仍在持续，本周期已经告警过
    StillStalled,
}

/// 积压历史与停滞检测
///
/// 固定容量的 FIFO 缓冲，超出容量时丢弃最旧的样本。停滞告警每个停滞周期
/// 只发一次，积压数量变化或清空后周期结束。
#[derive(Debug)]
pub struct BacklogTracker {
    samples: VecDeque<BacklogSample>,
    capacity: usize,
    min_samples: usize,
    stall_threshold: Duration,
    in_stall: bool,
    drained: bool,
}

impl BacklogTracker {
    pub fn new(config: &BacklogConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.history_capacity),
            capacity: config.history_capacity.max(1),
            min_samples: config.min_samples.max(1),
            stall_threshold: config.stall_threshold(),
            in_stall: false,
            drained: false,
        }
    }

    /// 追加一个样本并判定
    pub fn record(&mut self, count: u64, now: DateTime<Utc>) -> BacklogObservation {
        let changed = self.samples.back().is_some_and(|last| last.count != count);

        self.samples.push_back(BacklogSample {
            count,
            timestamp: now,
        });
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }

        if changed {
            self.in_stall = false;
        }

        if count == 0 {
            self.in_stall = false;
            if self.drained {
                return BacklogObservation::Idle;
            }
            self.drained = true;
            info!("待处理积压已清空");
            return BacklogObservation::Drained;
        }
        self.drained = false;

        if !self.is_stalled(count, now) {
            debug!("待处理积压: {} (变化中)", count);
            return BacklogObservation::Progressing;
        }

        if self.in_stall {
            debug!("待处理积压仍停滞在 {}", count);
            return BacklogObservation::StillStalled;
        }

        self.in_stall = true;
        let stalled_since = self.stalled_since(count).unwrap_or(now);
        let alert = Alert::new(
            AlertLevel::Warning,
            AlertKind::BacklogStalled {
                count,
                stalled_since,
                samples: self.samples.iter().copied().collect(),
            },
            format!(
                "待处理积压停滞在 {} 条，自 {} 起没有变化",
                count,
                stalled_since.to_rfc3339()
            ),
            now,
        );
        BacklogObservation::Stalled(alert)
    }

    /// 时间窗口内至少有 `min_samples` 个样本，且全部等于 `count`
    fn is_stalled(&self, count: u64, now: DateTime<Utc>) -> bool {
        let window_start = now - self.stall_threshold;
        let window: Vec<&BacklogSample> = self
            .samples
            .iter()
            .filter(|s| s.timestamp >= window_start)
            .collect();

        window.len() >= self.min_samples && window.iter().all(|s| s.count == count)
    }

    /// 当前连续相同数值的最早样本时间
    fn stalled_since(&self, count: u64) -> Option<DateTime<Utc>> {
        self.samples
            .iter()
            .rev()
            .take_while(|s| s.count == count)
            .last()
            .map(|s| s.timestamp)
    }

    pub fn samples(&self) -> Vec<BacklogSample> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<BacklogSample> {
        self.samples.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> BacklogTracker {
        BacklogTracker::new(&BacklogConfig {
            history_capacity: 20,
            min_samples: 4,
            stall_threshold_seconds: 120,
        })
    }

    fn start() -> DateTime<Utc> {
        "2025-06-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_stall_fires_at_fourth_sample() {
        let mut tracker = tracker();
        let t0 = start();

        for i in 0..3 {
            let obs = tracker.record(500, t0 + Duration::seconds(30 * i));
            assert_eq!(obs, BacklogObservation::Progressing, "sample {}", i + 1);
        }

        let obs = tracker.record(500, t0 + Duration::seconds(90));
        match obs {
            BacklogObservation::Stalled(alert) => {
                assert_eq!(alert.level, AlertLevel::Warning);
                match alert.kind {
                    AlertKind::BacklogStalled {
                        count,
                        stalled_since,
                        samples,
                    } => {
                        assert_eq!(count, 500);
                        assert_eq!(stalled_since, t0);
                        assert_eq!(samples.len(), 4);
                    }
                    other => panic!("unexpected alert kind: {other:?}"),
                }
            }
            other => panic!("expected stall at sample 4, got {other:?}"),
        }

        // 同一停滞周期不重复告警
        let obs = tracker.record(500, t0 + Duration::seconds(120));
        assert_eq!(obs, BacklogObservation::StillStalled);
    }

    #[test]
    fn test_draining_backlog_signals_once() {
        let mut tracker = tracker();
        let t0 = start();
        let sequence = [1200, 900, 600, 300, 0, 0, 0];

        let mut drained = 0;
        for (i, count) in sequence.iter().enumerate() {
            match tracker.record(*count, t0 + Duration::seconds(30 * i as i64)) {
                BacklogObservation::Stalled(_) | BacklogObservation::StillStalled => {
                    panic!("draining backlog must not stall")
                }
                BacklogObservation::Drained => drained += 1,
                _ => {}
            }
        }
        assert_eq!(drained, 1);

        // 再次出现积压后清空，重新报告
        tracker.record(10, t0 + Duration::seconds(300));
        assert_eq!(
            tracker.record(0, t0 + Duration::seconds(330)),
            BacklogObservation::Drained
        );
    }

    #[test]
    fn test_count_change_ends_stall_episode() {
        let mut tracker = tracker();
        let t0 = start();

        for i in 0..4 {
            tracker.record(500, t0 + Duration::seconds(30 * i));
        }
        assert_eq!(
            tracker.record(450, t0 + Duration::seconds(120)),
            BacklogObservation::Progressing
        );

        let mut fired = false;
        for i in 5..9 {
            if let BacklogObservation::Stalled(_) =
                tracker.record(450, t0 + Duration::seconds(30 * i))
            {
                fired = true;
            }
        }
        assert!(fired, "a new stall episode should alert again");
    }

    #[test]
    fn test_buffer_is_capped_fifo() {
        let mut tracker = tracker();
        let t0 = start();

        for i in 0..50u64 {
            tracker.record(i + 1, t0 + Duration::seconds(30 * i as i64));
            assert!(tracker.len() <= tracker.capacity());
        }

        let samples = tracker.samples();
        assert_eq!(samples.len(), 20);
        assert_eq!(samples.first().map(|s| s.count), Some(31));
        assert_eq!(samples.last().map(|s| s.count), Some(50));
    }

    #[test]
    fn test_sparse_samples_do_not_stall() {
        let mut tracker = tracker();
        let t0 = start();

        // 间隔过大，窗口内样本不足
        for i in 0..6 {
            let obs = tracker.record(500, t0 + Duration::seconds(100 * i));
            assert!(!matches!(obs, BacklogObservation::Stalled(_)));
        }
    }
}

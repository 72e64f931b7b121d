//! 挂起调用统计：按 agent、状态、年龄段聚合

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::pending::PendingCall;

/// 年龄段计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgeBuckets {
    #[serde(rename = "<1m")]
    pub under_1m: usize,
    #[serde(rename = "1m-10m")]
    pub from_1m_to_10m: usize,
    #[serde(rename = "10m-1h")]
    pub from_10m_to_1h: usize,
    #[serde(rename = ">1h")]
    pub over_1h: usize,
}

impl AgeBuckets {
    fn record(&mut self, age: chrono::Duration) {
        if age < chrono::Duration::minutes(1) {
            self.under_1m += 1;
        } else if age < chrono::Duration::minutes(10) {
            self.from_1m_to_10m += 1;
        } else if age < chrono::Duration::hours(1) {
            self.from_10m_to_1h += 1;
        } else {
            self.over_1h += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStats {
    pub total: usize,
    pub by_agent: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_age: AgeBuckets,
    pub archived: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_age_secs: Option<i64>,
}

impl PendingStats {
    pub fn collect<'a>(
        calls: impl IntoIterator<Item = &'a PendingCall>,
        archived: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = PendingStats {
            archived,
            ..Default::default()
        };
        for call in calls {
            let age = call.age(now);
            stats.total += 1;
            *stats.by_agent.entry(call.agent_id.clone()).or_default() += 1;
            *stats.by_status.entry(call.status.to_string()).or_default() += 1;
            stats.by_age.record(age);
            let secs = age.num_seconds();
            stats.oldest_age_secs = Some(stats.oldest_age_secs.map_or(secs, |o| o.max(secs)));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::store::CallStatus;

    #[test]
    fn test_stats_group_by_agent_status_age() {
        let now = Utc::now();
        let mut failed = PendingCall::new("b", "t", "r", "support", "f", json!({}))
            .with_created_at(now - Duration::minutes(5));
        failed.status = CallStatus::Failed;
        let calls = vec![
            PendingCall::new("a", "t", "r", "sales", "f", json!({})).with_created_at(now),
            failed,
            PendingCall::new("c", "t", "r", "sales", "f", json!({}))
                .with_created_at(now - Duration::hours(3)),
        ];

        let stats = PendingStats::collect(&calls, 4, now);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_agent["sales"], 2);
        assert_eq!(stats.by_status["failed"], 1);
        assert_eq!(stats.by_status["pending"], 2);
        assert_eq!(stats.by_age.under_1m, 1);
        assert_eq!(stats.by_age.from_1m_to_10m, 1);
        assert_eq!(stats.by_age.over_1h, 1);
        assert_eq!(stats.archived, 4);
        assert_eq!(stats.oldest_age_secs, Some(3 * 3600));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["byAge"][">1h"], 1);
    }
}

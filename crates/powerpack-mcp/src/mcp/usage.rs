use powerpack_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub(crate) struct ProviderUsage {
    pub calls: u64,
    pub ok: u64,
    pub rate_limited: u64,
    pub elapsed_ms_sum: u64,
}

/// In-process counters since server start. Never holds request content or secrets.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct UsageStats {
    pub started_at_epoch_s: u64,
    pub tool_calls: BTreeMap<String, u64>,
    pub providers: BTreeMap<String, ProviderUsage>,
}

fn now_epoch_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
pub(crate) struct Usage {
    inner: Arc<Mutex<UsageStats>>,
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(UsageStats {
                started_at_epoch_s: now_epoch_s(),
                tool_calls: BTreeMap::new(),
                providers: BTreeMap::new(),
            })),
        }
    }
}

impl Usage {
    fn lock(&self) -> MutexGuard<'_, UsageStats> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn inc_tool(&self, kind: &str) {
        *self.lock().tool_calls.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn record(&self, provider: &str, ok: bool, rate_limited: bool, elapsed_ms: u64) {
        let mut s = self.lock();
        let e = s.providers.entry(provider.to_string()).or_default();
        e.calls += 1;
        if ok {
            e.ok += 1;
        }
        if rate_limited {
            e.rate_limited += 1;
        }
        e.elapsed_ms_sum = e.elapsed_ms_sum.saturating_add(elapsed_ms);
    }

    pub(crate) fn record_result<T>(&self, provider: &str, r: &Result<T>, elapsed_ms: u64) {
        let rate_limited = matches!(r, Err(Error::RateLimited { .. }));
        self.record(provider, r.is_ok(), rate_limited, elapsed_ms);
    }

    pub(crate) fn snapshot(&self) -> UsageStats {
        self.lock().clone()
    }
}

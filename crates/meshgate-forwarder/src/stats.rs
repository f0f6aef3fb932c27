use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Process-wide forwarding counters. Cloning shares the same counters.
#[derive(Clone, Default)]
pub struct ForwarderStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    // TCP
    tcp_requests_total: AtomicU64,
    tcp_dial_fail_total: AtomicU64,
    tcp_endpoint_fail_total: AtomicU64,
    tcp_sessions_total: AtomicU64,
    tcp_sessions_active: AtomicU64,
    bytes_virtual_to_real_total: AtomicU64,
    bytes_real_to_virtual_total: AtomicU64,

    // UDP
    udp_flows_total: AtomicU64,
    udp_flows_active: AtomicU64,
    udp_flow_fail_total: AtomicU64,
}

/// Point-in-time copy of [`ForwarderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tcp_requests_total: u64,
    pub tcp_dial_fail_total: u64,
    pub tcp_endpoint_fail_total: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub bytes_virtual_to_real_total: u64,
    pub bytes_real_to_virtual_total: u64,
    pub udp_flows_total: u64,
    pub udp_flows_active: u64,
    pub udp_flow_fail_total: u64,
}

impl ForwarderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tcp_request(&self) {
        self.inner.tcp_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_dial_failed(&self) {
        self.inner
            .tcp_dial_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_endpoint_failed(&self) {
        self.inner
            .tcp_endpoint_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_session_opened(&self) {
        self.inner.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .tcp_sessions_active
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_session_closed(&self) {
        self.inner
            .tcp_sessions_active
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_virtual_to_real(&self, bytes: u64) {
        self.inner
            .bytes_virtual_to_real_total
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn bytes_real_to_virtual(&self, bytes: u64) {
        self.inner
            .bytes_real_to_virtual_total
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn udp_flow_opened(&self) {
        self.inner.udp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.inner.udp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn udp_flow_closed(&self) {
        self.inner.udp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn udp_flow_failed(&self) {
        self.inner
            .udp_flow_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        StatsSnapshot {
            tcp_requests_total: load(&inner.tcp_requests_total),
            tcp_dial_fail_total: load(&inner.tcp_dial_fail_total),
            tcp_endpoint_fail_total: load(&inner.tcp_endpoint_fail_total),
            tcp_sessions_total: load(&inner.tcp_sessions_total),
            tcp_sessions_active: load(&inner.tcp_sessions_active),
            bytes_virtual_to_real_total: load(&inner.bytes_virtual_to_real_total),
            bytes_real_to_virtual_total: load(&inner.bytes_real_to_virtual_total),
            udp_flows_total: load(&inner.udp_flows_total),
            udp_flows_active: load(&inner.udp_flows_active),
            udp_flow_fail_total: load(&inner.udp_flow_fail_total),
        }
    }

    /// Render the counters in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        push_counter(&mut out, "forwarder_tcp_requests_total", s.tcp_requests_total);
        push_counter(&mut out, "forwarder_tcp_dial_fail_total", s.tcp_dial_fail_total);
        push_counter(
            &mut out,
            "forwarder_tcp_endpoint_fail_total",
            s.tcp_endpoint_fail_total,
        );
        push_counter(&mut out, "forwarder_tcp_sessions_total", s.tcp_sessions_total);
        push_gauge(&mut out, "forwarder_tcp_sessions_active", s.tcp_sessions_active);
        push_counter(
            &mut out,
            "forwarder_bytes_virtual_to_real_total",
            s.bytes_virtual_to_real_total,
        );
        push_counter(
            &mut out,
            "forwarder_bytes_real_to_virtual_total",
            s.bytes_real_to_virtual_total,
        );

        push_counter(&mut out, "forwarder_udp_flows_total", s.udp_flows_total);
        push_gauge(&mut out, "forwarder_udp_flows_active", s.udp_flows_active);
        push_counter(&mut out, "forwarder_udp_flow_fail_total", s.udp_flow_fail_total);

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "counter", val);
}

fn push_metric(out: &mut String, name: &str, kind: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::ForwarderStats;

    #[test]
    fn session_gauge_tracks_open_and_close() {
        let stats = ForwarderStats::new();
        stats.tcp_session_opened();
        stats.tcp_session_opened();
        stats.tcp_session_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.tcp_sessions_total, 2);
        assert_eq!(snap.tcp_sessions_active, 1);
    }

    #[test]
    fn prometheus_output_has_type_lines() {
        let stats = ForwarderStats::new();
        stats.tcp_dial_failed();
        stats.bytes_virtual_to_real(42);

        let body = stats.render_prometheus();
        assert!(body.contains("# TYPE forwarder_tcp_dial_fail_total counter\n"));
        assert!(body.contains("forwarder_tcp_dial_fail_total 1\n"));
        assert!(body.contains("# TYPE forwarder_tcp_sessions_active gauge\n"));
        assert!(body.contains("forwarder_bytes_virtual_to_real_total 42\n"));
    }
}

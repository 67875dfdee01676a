use std::fmt;

use crate::Rate;

/// Point-in-time statistics of a [`crate::Runner`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RuntimeStats {
    /// Client to destination throughput of the last full interval
    pub upload_rate: Rate,
    /// Destination to client throughput of the last full interval
    pub download_rate: Rate,
    /// Rate currently guaranteed to each sending host, in bytes per second
    pub guaranteed_send: f64,
    /// Rate currently guaranteed to each receiving host, in bytes per second
    pub guaranteed_recv: f64,
    /// Total bytes relayed from clients to destinations
    pub bytes_sent: i64,
    /// Total bytes relayed from destinations to clients
    pub bytes_received: i64,
    /// Hosts with an active upload
    pub send_hosts: usize,
    /// Hosts with an active download
    pub recv_hosts: usize,
    /// Requests and tunnels in flight
    pub concurrent_requests: i64,
    /// Tokens left in the global upload limiter
    pub main_send_tokens: f64,
    /// Tokens left in the global download limiter
    pub main_recv_tokens: f64,
    /// Worker threads of the tokio runtime the stats were taken on
    pub workers: Option<usize>,
    /// Tasks alive on the tokio runtime the stats were taken on
    pub alive_tasks: Option<usize>,
}

fn mib(bytes_per_second: f64) -> f64 {
    bytes_per_second / 1024.0 / 1024.0
}

#[allow(clippy::cast_possible_truncation)]
const fn whole(tokens: f64) -> i64 {
    tokens as i64
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UploadSpeed: {}", self.upload_rate)?;
        writeln!(f, "DownloadSpeed: {}", self.download_rate)?;
        writeln!(
            f,
            "GuaranteedThroughput(send): {:.2} MB/s",
            mib(self.guaranteed_send)
        )?;
        writeln!(
            f,
            "GuaranteedThroughput(recv): {:.2} MB/s",
            mib(self.guaranteed_recv)
        )?;
        writeln!(f, "BytesSent: {}", self.bytes_sent)?;
        writeln!(f, "BytesReceived: {}", self.bytes_received)?;
        writeln!(f, "ConcurrentRemotes(send): {}", self.send_hosts)?;
        writeln!(f, "ConcurrentRemotes(recv): {}", self.recv_hosts)?;
        writeln!(f, "NumConcurrentRequests: {}", self.concurrent_requests)?;
        writeln!(f, "MainRecvLimiterTokens: {}", whole(self.main_recv_tokens))?;
        writeln!(f, "MainSendLimiterTokens: {}", whole(self.main_send_tokens))?;
        if let Some(workers) = self.workers {
            writeln!(f, "NumWorkers: {workers}")?;
        }
        if let Some(tasks) = self.alive_tasks {
            writeln!(f, "NumAliveTasks: {tasks}")?;
        }
        Ok(())
    }
}

impl RuntimeStats {
    /// Single-line `key=value` rendering for log output
    #[must_use]
    pub fn log_line(&self) -> String {
        format!(
            "upload={} download={} guaranteed_send={:.2}MB/s guaranteed_recv={:.2}MB/s \
             bytes_sent={} bytes_received={} send_hosts={} recv_hosts={} requests={}",
            self.upload_rate,
            self.download_rate,
            mib(self.guaranteed_send),
            mib(self.guaranteed_recv),
            self.bytes_sent,
            self.bytes_received,
            self.send_hosts,
            self.recv_hosts,
            self.concurrent_requests,
        )
    }
}

//! Operating system facing pieces: connection table, extended statistics and
//! process lookup. Off Windows the syscalls report `Unsupported`.

pub mod estats;
pub mod process;
pub mod tcp_table;

pub use estats::{
    classify_status, ConnectionStats, EStatsCollector, StatsOutcome, StatsProvider,
    UnavailableReason,
};
pub use process::{ProcessMetadataSource, ProcessNameCache, ProgramInfo, SystemProcessSource, PROCESS_NAMES};
pub use tcp_table::{
    group_by_process, summarize, ConnectionInfo, ConnectionSource, ConnectionTableSummary,
    TcpState, TcpTableEnumerator,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("failed to load eBPF object: {source}")]
    Ebpf {
        #[from]
        source: aya::EbpfError,
    },

    #[error("eBPF program error: {source}")]
    Program {
        #[from]
        source: aya::programs::ProgramError,
    },

    #[error("eBPF map error: {source}")]
    Map {
        #[from]
        source: aya::maps::MapError,
    },

    #[error("perf buffer error: {source}")]
    PerfBuffer {
        #[from]
        source: aya::maps::perf::PerfBufferError,
    },

    #[error("{0} not found in eBPF object")]
    Missing(&'static str),

    #[error("monitored interface registry is full ({capacity} entries)")]
    RegistryFull { capacity: u32 },

    #[error("unknown interface {0}")]
    UnknownInterface(String),

    #[error("ifindex {0} is not registered")]
    NotRegistered(u32),

    #[error("malformed tracepoint format: {0}")]
    TraceFormat(String),

    #[error("malformed BTF: {0}")]
    Btf(String),

    #[error("insufficient privileges, missing {0}")]
    Permission(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Source of a trigger signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Trigger from a command or network server (for example a HiSLIP Trigger message).
    Bus,

    /// Trigger sent by INITiate
    Immediate,

    /// Internal trigger, for example a timer
    Internal,

    /// Trigger from an external input
    External,
}

/// Identifies which wire protocol a listening port speaks.
///
/// Framing is selected by port, not sniffed from the byte stream (see
/// `framing::reassembler_for`), so this is also the dispatch key for picking a codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Gt06,
    Teltonika,
}

impl Protocol {
    /// Default listen port for this protocol, per `GT06_PORT`/`TELTONIKA_PORT`.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Gt06 => 5023,
            Protocol::Teltonika => 5024,
        }
    }
}

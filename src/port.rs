use std::fmt;

use crate::api::Api;

/// Whether an endpoint belongs to a physical device or to another piece
/// of software, when the transport can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    Hardware,
    Software,
    #[default]
    Unknown,
}

/// Identifies one MIDI endpoint as enumerated by an observer.
///
/// Port identifiers are plain values: they can be cloned, stored and
/// outlive the observer that produced them. The `client` and `port`
/// handles are backend-private encodings; the only portable guarantee is
/// that equal handles name the same endpoint within one process lifetime,
/// and that a handle obtained from enumeration opens the same endpoint it
/// was enumerated from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PortInfo {
    /// Which backend produced (and can open) this port.
    pub api: Option<Api>,
    /// Backend-scoped client handle, if the API has such a notion.
    pub client: u64,
    /// Backend-private port handle (e.g. packed ALSA client/port pair).
    pub port: u64,
    pub manufacturer: String,
    pub device_name: String,
    pub port_name: String,
    pub display_name: String,
    pub kind: TransportKind,
}

impl PortInfo {
    /// The most descriptive name available for UI purposes.
    pub fn best_name(&self) -> &str {
        for name in [&self.display_name, &self.port_name, &self.device_name] {
            if !name.is_empty() {
                return name;
            }
        }
        "(unnamed port)"
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.api {
            Some(api) => write!(f, "{} [{}]", self.best_name(), api.name()),
            None => write!(f, "{}", self.best_name()),
        }
    }
}

/// A port messages can be received from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InputPort(pub PortInfo);

/// A port messages can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OutputPort(pub PortInfo);

impl std::ops::Deref for InputPort {
    type Target = PortInfo;
    fn deref(&self) -> &PortInfo {
        &self.0
    }
}

impl std::ops::Deref for OutputPort {
    type Target = PortInfo;
    fn deref(&self) -> &PortInfo {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_name_falls_back_in_order() {
        let mut info = PortInfo { port_name: "Port 1".into(), ..Default::default() };
        assert_eq!(info.best_name(), "Port 1");
        info.display_name = "Synth Port 1".into();
        assert_eq!(info.best_name(), "Synth Port 1");
        assert_eq!(PortInfo::default().best_name(), "(unnamed port)");
    }

    #[test]
    fn ports_are_plain_values() {
        fn is_send<T: Send>() {}
        fn is_clone<T: Clone>() {}
        is_send::<InputPort>();
        is_send::<OutputPort>();
        is_clone::<InputPort>();
        is_clone::<OutputPort>();
    }
}

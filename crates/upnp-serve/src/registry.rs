//! The device/service registry: state variables and actions parsed out of
//! the standard UPnP SCPD documents, plus the current value of every
//! observed state variable.
//!
//! Mirrors the role of Macast's `Service`/`StateVariable`/`Action` classes,
//! built once at startup from XML instead of at every `call()`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use parking_lot::RwLock;
use serde_derive::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    AvTransport,
    RenderingControl,
    ConnectionManager,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::AvTransport,
        ServiceKind::RenderingControl,
        ServiceKind::ConnectionManager,
    ];

    pub fn path_segment(self) -> &'static str {
        match self {
            ServiceKind::AvTransport => "AVTransport",
            ServiceKind::RenderingControl => "RenderingControl",
            ServiceKind::ConnectionManager => "ConnectionManager",
        }
    }

    pub fn service_id(self) -> &'static str {
        match self {
            ServiceKind::AvTransport => "urn:upnp-org:serviceId:AVTransport",
            ServiceKind::RenderingControl => "urn:upnp-org:serviceId:RenderingControl",
            ServiceKind::ConnectionManager => "urn:upnp-org:serviceId:ConnectionManager",
        }
    }

    pub fn namespace(self) -> &'static str {
        match self {
            ServiceKind::AvTransport => crate::constants::SERVICE_TYPE_AV_TRANSPORT,
            ServiceKind::RenderingControl => crate::constants::SERVICE_TYPE_RENDERING_CONTROL,
            ServiceKind::ConnectionManager => crate::constants::SERVICE_TYPE_CONNECTION_MANAGER,
        }
    }

    /// State variables pushed in the initial event sent right after SUBSCRIBE.
    pub fn observed_variables(self) -> &'static [&'static str] {
        match self {
            ServiceKind::AvTransport => &[
                "TransportState",
                "TransportStatus",
                "CurrentMediaDuration",
                "CurrentTrackDuration",
                "CurrentTrack",
                "NumberOfTracks",
                "CurrentTrackTitle",
            ],
            ServiceKind::RenderingControl => &["Volume", "Mute"],
            ServiceKind::ConnectionManager => {
                &["SinkProtocolInfo", "A_ARG_TYPE_Direction", "CurrentConnectionIDs"]
            }
        }
    }

    /// ConnectionManager events are flat `<e:property>` children; the other
    /// two services wrap changes in a `LastChange` event document.
    pub fn uses_last_change_wrapper(self) -> bool {
        !matches!(self, ServiceKind::ConnectionManager)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl FromStr for ServiceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVTransport" => Ok(ServiceKind::AvTransport),
            "RenderingControl" => Ok(ServiceKind::RenderingControl),
            "ConnectionManager" => Ok(ServiceKind::ConnectionManager),
            other => bail!("unknown service {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    I2,
    Ui2,
    I4,
    Ui4,
    String,
}

impl DataType {
    fn parse(s: &str) -> Self {
        match s {
            "boolean" => DataType::Boolean,
            "i2" => DataType::I2,
            "ui2" => DataType::Ui2,
            "i4" => DataType::I4,
            "ui4" => DataType::Ui4,
            _ => DataType::String,
        }
    }

    /// Whether `value` is a syntactically valid literal of this type.
    /// Strings and booleans never fail; numeric types must parse.
    fn conforms(self, value: &str) -> bool {
        match self {
            DataType::Boolean => matches!(value, "0" | "1" | "true" | "false"),
            DataType::I2 | DataType::I4 => value.parse::<i64>().is_ok(),
            DataType::Ui2 | DataType::Ui4 => value.parse::<u64>().is_ok(),
            DataType::String => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateVariable {
    pub name: String,
    pub datatype: DataType,
    pub send_events: bool,
    pub minimum: Option<i64>,
    pub maximum: Option<i64>,
    pub allowed_values: Option<Vec<String>>,
    pub value: String,
}

impl StateVariable {
    /// Validates `value` against allowed-value list / numeric range / datatype,
    /// per the registry's declared constraints for this variable.
    pub fn validate(&self, value: &str) -> anyhow::Result<()> {
        if !self.datatype.conforms(value) {
            bail!("value {value:?} does not conform to {:?}", self.datatype);
        }
        if let Some(allowed) = &self.allowed_values {
            if !allowed.iter().any(|a| a == value) {
                bail!("value {value:?} not in allowed value list {allowed:?}");
            }
        }
        if self.minimum.is_some() || self.maximum.is_some() {
            let parsed: i64 = value
                .parse()
                .with_context(|| format!("value {value:?} is not numeric"))?;
            if let Some(min) = self.minimum {
                if parsed < min {
                    bail!("value {parsed} below minimum {min}");
                }
            }
            if let Some(max) = self.maximum {
                if parsed > max {
                    bail!("value {parsed} above maximum {max}");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub related_state_variable: String,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub input: Vec<Argument>,
    pub output: Vec<Argument>,
}

pub struct Service {
    pub kind: ServiceKind,
    pub actions: HashMap<String, Action>,
    state: RwLock<HashMap<String, StateVariable>>,
}

impl Service {
    pub fn get_state(&self, name: &str) -> Option<String> {
        self.state.read().get(name).map(|v| v.value.clone())
    }

    pub fn get_all_observed(&self) -> Vec<(String, String)> {
        self.kind
            .observed_variables()
            .iter()
            .filter_map(|name| self.get_state(name).map(|v| ((*name).to_owned(), v)))
            .collect()
    }

    /// Validates and commits a new value, returning the previous value.
    pub fn set_state(&self, name: &str, value: impl Into<String>) -> anyhow::Result<Option<String>> {
        let value = value.into();
        let mut g = self.state.write();
        let var = g.get_mut(name).with_context(|| format!("no such state variable {name}"))?;
        var.validate(&value)?;
        Ok(Some(std::mem::replace(&mut var.value, value)))
    }

    /// Like [`Self::set_state`] but does not fail if the variable is unknown
    /// (used for seeding constants that may not appear in every SCPD).
    pub fn set_state_lenient(&self, name: &str, value: impl Into<String>) {
        let _ = self.set_state(name, value);
    }

    pub fn seed_default(&self, name: &str, value: impl Into<String>) {
        let mut g = self.state.write();
        if let Some(var) = g.get_mut(name) {
            var.value = value.into();
        }
    }

    /// Declares a state variable that isn't part of the service's SCPD
    /// document — used for values this renderer surfaces that aren't part
    /// of the standard schema (e.g. a convenience "now playing" title).
    pub fn define_custom_variable(&self, name: &str, default: impl Into<String>) {
        let mut g = self.state.write();
        g.entry(name.to_owned()).or_insert_with(|| StateVariable {
            name: name.to_owned(),
            datatype: DataType::String,
            send_events: true,
            minimum: None,
            maximum: None,
            allowed_values: None,
            value: default.into(),
        });
    }
}

// --- SCPD XML parsing -------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScpdDoc {
    #[serde(rename = "actionList", default)]
    action_list: ActionListXml,
    #[serde(rename = "serviceStateTable", default)]
    service_state_table: ServiceStateTableXml,
}

#[derive(Debug, Default, Deserialize)]
struct ActionListXml {
    #[serde(rename = "action", default)]
    actions: Vec<ActionXml>,
}

#[derive(Debug, Deserialize)]
struct ActionXml {
    name: String,
    #[serde(rename = "argumentList", default)]
    argument_list: ArgumentListXml,
}

#[derive(Debug, Default, Deserialize)]
struct ArgumentListXml {
    #[serde(rename = "argument", default)]
    arguments: Vec<ArgumentXml>,
}

#[derive(Debug, Deserialize)]
struct ArgumentXml {
    name: String,
    direction: String,
    #[serde(rename = "relatedStateVariable")]
    related_state_variable: String,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceStateTableXml {
    #[serde(rename = "stateVariable", default)]
    vars: Vec<StateVariableXml>,
}

#[derive(Debug, Deserialize)]
struct StateVariableXml {
    #[serde(rename = "@sendEvents", default)]
    send_events: Option<String>,
    name: String,
    #[serde(rename = "dataType")]
    data_type: String,
    #[serde(rename = "defaultValue", default)]
    default_value: Option<String>,
    #[serde(rename = "allowedValueList", default)]
    allowed_value_list: Option<AllowedValueListXml>,
    #[serde(rename = "allowedValueRange", default)]
    allowed_value_range: Option<AllowedValueRangeXml>,
}

#[derive(Debug, Deserialize)]
struct AllowedValueListXml {
    #[serde(rename = "allowedValue", default)]
    values: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AllowedValueRangeXml {
    minimum: Option<i64>,
    maximum: Option<i64>,
}

impl Service {
    pub fn from_scpd_xml(kind: ServiceKind, xml: &str) -> anyhow::Result<Self> {
        let doc: ScpdDoc = quick_xml::de::from_str(xml).context("error parsing SCPD xml")?;

        let mut actions = HashMap::new();
        for a in doc.action_list.actions {
            let mut input = Vec::new();
            let mut output = Vec::new();
            for arg in a.argument_list.arguments {
                let argument = Argument {
                    name: arg.name,
                    related_state_variable: arg.related_state_variable,
                };
                match arg.direction.as_str() {
                    "in" => input.push(argument),
                    _ => output.push(argument),
                }
            }
            actions.insert(a.name.clone(), Action { name: a.name, input, output });
        }

        let mut state = HashMap::new();
        for v in doc.service_state_table.vars {
            let send_events = v.send_events.as_deref() != Some("no");
            let datatype = DataType::parse(&v.data_type);
            let allowed_values = v.allowed_value_list.map(|l| l.values);
            let (minimum, maximum) = v
                .allowed_value_range
                .map(|r| (r.minimum, r.maximum))
                .unwrap_or((None, None));
            let value = v.default_value.unwrap_or_default();
            state.insert(
                v.name.clone(),
                StateVariable {
                    name: v.name,
                    datatype,
                    send_events,
                    minimum,
                    maximum,
                    allowed_values,
                    value,
                },
            );
        }

        Ok(Service { kind, actions, state: RwLock::new(state) })
    }
}

pub struct Registry {
    pub av_transport: Service,
    pub rendering_control: Service,
    pub connection_manager: Service,
}

impl Registry {
    pub fn from_scpd(
        av_transport_xml: &str,
        rendering_control_xml: &str,
        connection_manager_xml: &str,
    ) -> anyhow::Result<Self> {
        let registry = Registry {
            av_transport: Service::from_scpd_xml(ServiceKind::AvTransport, av_transport_xml)?,
            rendering_control: Service::from_scpd_xml(
                ServiceKind::RenderingControl,
                rendering_control_xml,
            )?,
            connection_manager: Service::from_scpd_xml(
                ServiceKind::ConnectionManager,
                connection_manager_xml,
            )?,
        };
        registry.seed_constants();
        Ok(registry)
    }

    pub fn service(&self, kind: ServiceKind) -> &Service {
        match kind {
            ServiceKind::AvTransport => &self.av_transport,
            ServiceKind::RenderingControl => &self.rendering_control,
            ServiceKind::ConnectionManager => &self.connection_manager,
        }
    }

    /// Seeds state variables that are constant for the lifetime of the
    /// process and not meaningfully expressed by a `defaultValue` alone.
    fn seed_constants(&self) {
        let av = &self.av_transport;
        av.seed_default("TransportState", "NO_MEDIA_PRESENT");
        av.seed_default("TransportStatus", "OK");
        av.seed_default("TransportPlaySpeed", "1");
        av.seed_default("CurrentPlayMode", "NORMAL");
        av.seed_default("PlaybackStorageMedium", "NONE");
        av.seed_default("NumberOfTracks", "0");
        av.seed_default("CurrentTrack", "0");
        for var in [
            "CurrentTrackDuration",
            "CurrentMediaDuration",
            "RelativeTimePosition",
            "AbsoluteTimePosition",
        ] {
            av.seed_default(var, "00:00:00");
        }
        av.seed_default("RelativeCounterPosition", "2147483647");
        av.seed_default("AbsoluteCounterPosition", "2147483647");
        av.define_custom_variable("CurrentTrackTitle", "");

        let rc = &self.rendering_control;
        rc.seed_default("Volume", "50");
        rc.seed_default("Mute", "0");

        let cm = &self.connection_manager;
        cm.seed_default(
            "SinkProtocolInfo",
            "http-get:*:video/mp4:*,http-get:*:video/x-matroska:*,http-get:*:audio/mpeg:*",
        );
        cm.seed_default("SourceProtocolInfo", "");
        cm.seed_default("A_ARG_TYPE_Direction", "Output");
        cm.seed_default("CurrentConnectionIDs", "0");
        cm.seed_default("A_ARG_TYPE_ConnectionStatus", "OK");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AVT_SCPD: &str = include_str!("../resources/xml/AVTransport.xml");
    const RC_SCPD: &str = include_str!("../resources/xml/RenderingControl.xml");
    const CM_SCPD: &str = include_str!("../resources/xml/ConnectionManager.xml");

    #[test]
    fn test_parse_av_transport_scpd() {
        let svc = Service::from_scpd_xml(ServiceKind::AvTransport, AVT_SCPD).unwrap();
        assert!(svc.actions.contains_key("Play"));
        assert!(svc.actions.contains_key("SetAVTransportURI"));
        let play = &svc.actions["Play"];
        assert_eq!(play.input.len(), 2);
        assert_eq!(svc.get_state("TransportState").as_deref(), Some("STOPPED"));
    }

    #[test]
    fn test_registry_seeds_constants() {
        let reg = Registry::from_scpd(AVT_SCPD, RC_SCPD, CM_SCPD).unwrap();
        assert_eq!(
            reg.av_transport.get_state("TransportState").as_deref(),
            Some("NO_MEDIA_PRESENT")
        );
        assert_eq!(reg.rendering_control.get_state("Volume").as_deref(), Some("50"));
        assert_eq!(
            reg.connection_manager.get_state("A_ARG_TYPE_Direction").as_deref(),
            Some("Output")
        );
    }

    #[test]
    fn test_volume_range_validation() {
        let reg = Registry::from_scpd(AVT_SCPD, RC_SCPD, CM_SCPD).unwrap();
        assert!(reg.rendering_control.set_state("Volume", "0").is_ok());
        assert!(reg.rendering_control.set_state("Volume", "100").is_ok());
        assert!(reg.rendering_control.set_state("Volume", "101").is_err());
    }

    #[test]
    fn test_unknown_service_kind() {
        assert!("Foo".parse::<ServiceKind>().is_err());
        assert_eq!("AVTransport".parse::<ServiceKind>().unwrap(), ServiceKind::AvTransport);
    }
}

use k8s_openapi::api::core::v1::ContainerPort;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::TcpListener;
use std::ops::Deref;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Pod annotation listing the forwards offered by default.
pub const PORT_FORWARDS_KEY: &str = "k9scli.io/portforwards";
/// Pod annotation listing forwards started without asking.
pub const AUTO_PORT_FORWARDS_KEY: &str = "k9scli.io/auto-portforwards";

/// Container port reference, either numeric or by its declared name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PortRef {
    Number(u16),
    Named(String),
}

impl Display for PortRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// One TCP port declared by a container.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContainerPortSpec {
    pub container: String,
    pub port_name: String,
    pub port_number: u16,
}

impl ContainerPortSpec {
    pub fn new(container: &str, port_name: &str, port_number: u16) -> Self {
        Self {
            container: container.to_string(),
            port_name: port_name.to_string(),
            port_number,
        }
    }

    pub fn port(&self) -> PortRef {
        if self.port_name.is_empty() {
            PortRef::Number(self.port_number)
        } else {
            PortRef::Named(self.port_name.clone())
        }
    }

    pub fn matches(&self, annotation: &PfAnnotation) -> bool {
        if self.container != annotation.container {
            return false;
        }
        match &annotation.container_port {
            PortRef::Number(number) => *number == self.port_number,
            PortRef::Named(name) => *name == self.port_name,
        }
    }

    /// True when `raw` (`container::port...`) names this container and port.
    pub fn matches_spec(&self, raw: &str) -> bool {
        let Some((container, rest)) = raw.split_once("::") else {
            return false;
        };
        let port = rest.split([':', '/']).next().unwrap_or_default();
        container == self.container && port == self.port_number.to_string()
    }

    pub fn to_annotation(&self) -> PfAnnotation {
        PfAnnotation {
            container: self.container.clone(),
            container_port: self.port(),
            local_port: Some(self.port_number),
            port_number: Some(self.port_number),
        }
    }

    pub fn to_tunnel(&self, address: &str) -> PortTunnel {
        PortTunnel {
            address: address.to_string(),
            container: self.container.clone(),
            local_port: self.port_number,
            container_port: self.port_number,
        }
    }
}

impl Display for ContainerPortSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.container, self.port_number)?;
        if !self.port_name.is_empty() {
            write!(f, "({})", self.port_name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ContainerPortSpecs(pub Vec<ContainerPortSpec>);

impl ContainerPortSpecs {
    /// Collects the TCP ports of one container. Ports without a protocol are TCP.
    pub fn from_container_ports(container: &str, ports: &[ContainerPort]) -> Self {
        ports
            .iter()
            .filter(|port| port.protocol.as_deref().unwrap_or("TCP") == "TCP")
            .filter_map(|port| {
                let number = u16::try_from(port.container_port).ok()?;
                Some(ContainerPortSpec::new(
                    container,
                    port.name.as_deref().unwrap_or_default(),
                    number,
                ))
            })
            .collect()
    }

    pub fn find(&self, annotation: &PfAnnotation) -> Option<&ContainerPortSpec> {
        self.0.iter().find(|spec| spec.matches(annotation))
    }

    pub fn matches(&self, annotation: &PfAnnotation) -> bool {
        self.find(annotation).is_some()
    }

    /// Accepts free-form entries and anything when no port is declared.
    pub fn matches_spec(&self, raw: &str) -> bool {
        if self.0.is_empty() || !raw.contains("::") {
            return true;
        }
        self.0.iter().any(|spec| spec.matches_spec(raw))
    }

    /// First entry of a `container::port` list that names no declared port.
    pub fn undeclared<'a>(&self, raw: &'a str) -> Option<&'a str> {
        raw.split(',')
            .map(str::trim)
            .find(|entry| !self.matches_spec(entry))
    }

    pub fn to_tunnels(&self, address: &str) -> Vec<PortTunnel> {
        self.0.iter().map(|spec| spec.to_tunnel(address)).collect()
    }

    pub fn dump(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Deref for ContainerPortSpecs {
    type Target = [ContainerPortSpec];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<ContainerPortSpec> for ContainerPortSpecs {
    fn from_iter<T: IntoIterator<Item = ContainerPortSpec>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A requested forward: `container::[local:]port[/number]`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PfAnnotation {
    pub container: String,
    pub container_port: PortRef,
    local_port: Option<u16>,
    port_number: Option<u16>,
}

impl PfAnnotation {
    /// Numeric container port, from the port itself or its `/number` suffix.
    pub fn port_num(&self) -> EngineResult<u16> {
        self.port_number.ok_or(EngineError::NoPortNumber)
    }

    pub fn matches(&self, specs: &ContainerPortSpecs) -> bool {
        specs.matches(self)
    }

    pub fn to_tunnel(&self, address: &str) -> EngineResult<PortTunnel> {
        let container_port = self.port_num()?;
        Ok(PortTunnel {
            address: address.to_string(),
            container: self.container.clone(),
            local_port: self.local_port.unwrap_or(container_port),
            container_port,
        })
    }
}

impl Display for PfAnnotation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.local_port, self.port_number) {
            (Some(local), Some(number)) => write!(f, "{}::{local}:{number}", self.container),
            (Some(local), None) => {
                write!(f, "{}::{local}:{}", self.container, self.container_port)
            }
            (None, _) => write!(f, "{}::{}", self.container, self.container_port),
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PfAnnotations(pub Vec<PfAnnotation>);

impl PfAnnotations {
    /// Resolves every entry to a tunnel, keeping those `available` accepts.
    /// Entries naming a container that does not declare the port are
    /// dropped; bare entries go to the default container. An entry without a
    /// numeric port fails the whole call.
    pub fn to_tunnels<F>(
        &self,
        address: &str,
        specs: &ContainerPortSpecs,
        available: F,
    ) -> EngineResult<Vec<PortTunnel>>
    where
        F: Fn(&PortTunnel) -> bool,
    {
        let mut tunnels = Vec::with_capacity(self.0.len());
        for annotation in &self.0 {
            let tunnel = annotation.to_tunnel(address)?;
            if !annotation.container.is_empty() && !annotation.matches(specs) {
                debug!(%annotation, "skipping undeclared port");
                continue;
            }
            if available(&tunnel) {
                tunnels.push(tunnel);
            }
        }
        Ok(tunnels)
    }

    /// Renders the entries as the `container::port` and local port lists
    /// used to prefill a forward form.
    pub fn to_port_spec(&self, specs: &ContainerPortSpecs) -> (String, String) {
        let mut containers = Vec::with_capacity(self.0.len());
        let mut locals = Vec::with_capacity(self.0.len());
        for annotation in &self.0 {
            let Some(number) = annotation
                .port_num()
                .ok()
                .or_else(|| specs.find(annotation).map(|spec| spec.port_number))
            else {
                continue;
            };
            containers.push(format!("{}::{number}", annotation.container));
            locals.push(annotation.local_port.unwrap_or(number).to_string());
        }
        (containers.join(","), locals.join(","))
    }
}

impl Deref for PfAnnotations {
    type Target = [PfAnnotation];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<PfAnnotation> for PfAnnotations {
    fn from_iter<T: IntoIterator<Item = PfAnnotation>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A dial-ready forward.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PortTunnel {
    pub address: String,
    pub container: String,
    pub local_port: u16,
    pub container_port: u16,
}

impl PortTunnel {
    pub fn port_map(&self) -> String {
        format!("{}:{}", self.local_port, self.container_port)
    }
}

fn parse_port(raw: &str) -> Option<PortRef> {
    if raw.is_empty() {
        return None;
    }
    if raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return raw.parse().ok().map(PortRef::Number);
    }
    raw.bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-')
        .then(|| PortRef::Named(raw.to_string()))
}

fn parse_number(raw: &str) -> Option<u16> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

pub fn parse_pf(raw: &str) -> EngineResult<PfAnnotation> {
    let invalid = || EngineError::InvalidSpec(raw.to_string());
    let (container, rest) = raw.split_once("::").unwrap_or(("", raw));
    if container.contains(':') {
        return Err(invalid());
    }

    let (body, suffix) = match rest.split_once('/') {
        Some((body, number)) => (body, Some(parse_number(number).ok_or_else(invalid)?)),
        None => (rest, None),
    };
    let (local, port) = match body.split(':').collect::<Vec<_>>().as_slice() {
        [port] => (None, *port),
        [local, port] => (Some(parse_number(local).ok_or_else(invalid)?), *port),
        _ => return Err(invalid()),
    };
    let container_port = parse_port(port).ok_or_else(invalid)?;

    let port_number = suffix.or(match container_port {
        PortRef::Number(number) => Some(number),
        PortRef::Named(_) => None,
    });

    Ok(PfAnnotation {
        container: container.to_string(),
        container_port,
        local_port: local.or(port_number),
        port_number,
    })
}

/// Parses a comma separated list. One bad entry fails the whole list.
pub fn parse_pfs(raw: &str) -> EngineResult<PfAnnotations> {
    raw.split(',')
        .map(str::trim)
        .map(parse_pf)
        .collect::<EngineResult<Vec<_>>>()
        .map(PfAnnotations)
}

/// Forwards offered for a pod. Without a forward annotation this is the
/// first declared port; with one, only entries backed by a declared port.
pub fn preferred_ports(
    annotations: Option<&BTreeMap<String, String>>,
    specs: &ContainerPortSpecs,
) -> EngineResult<PfAnnotations> {
    match annotations.and_then(|annotations| annotations.get(PORT_FORWARDS_KEY)) {
        Some(raw) => Ok(parse_pfs(raw)?
            .0
            .into_iter()
            .filter(|annotation| annotation.matches(specs))
            .collect()),
        None => Ok(specs
            .first()
            .map(|spec| PfAnnotations(vec![spec.to_annotation()]))
            .unwrap_or_default()),
    }
}

pub fn auto_forwards(annotations: Option<&BTreeMap<String, String>>) -> Option<&str> {
    annotations
        .and_then(|annotations| annotations.get(AUTO_PORT_FORWARDS_KEY))
        .map(String::as_str)
}

/// Tunnels requested by the auto-forward annotation. `None` when the pod
/// carries no such annotation.
pub fn auto_tunnels(
    annotations: Option<&BTreeMap<String, String>>,
    specs: &ContainerPortSpecs,
    address: &str,
) -> EngineResult<Option<Vec<PortTunnel>>> {
    let Some(raw) = auto_forwards(annotations) else {
        return Ok(None);
    };
    parse_pfs(raw)?
        .to_tunnels(address, specs, is_port_free)
        .map(Some)
}

/// Builds tunnels from a `container::port` list and a matching local port list.
pub fn to_tunnels(address: &str, specs: &str, ports: &str) -> EngineResult<Vec<PortTunnel>> {
    let annotations = parse_pfs(specs)?;
    let locals = ports
        .split(',')
        .map(|port| parse_number(port.trim()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| EngineError::InvalidSpec(ports.to_string()))?;
    if locals.len() != annotations.len() {
        return Err(EngineError::InvalidSpec(format!(
            "container to local port mismatch {specs} vs {ports}"
        )));
    }

    annotations
        .iter()
        .zip(locals)
        .map(|(annotation, local_port)| {
            Ok(PortTunnel {
                address: address.to_string(),
                container: annotation.container.clone(),
                local_port,
                container_port: annotation.port_num()?,
            })
        })
        .collect()
}

/// Probes the local end by binding and releasing it.
pub fn probe(tunnel: &PortTunnel) -> EngineResult<()> {
    TcpListener::bind((tunnel.address.as_str(), tunnel.local_port))
        .map(drop)
        .map_err(|source| EngineError::PortUnavailable {
            address: tunnel.address.clone(),
            port: tunnel.local_port,
            source,
        })
}

pub fn is_port_free(tunnel: &PortTunnel) -> bool {
    probe(tunnel).is_ok()
}

pub fn check_available(tunnels: &[PortTunnel]) -> EngineResult<()> {
    tunnels.iter().try_for_each(probe)
}

#[cfg(test)]
mod tests {
    use super::{
        AUTO_PORT_FORWARDS_KEY, ContainerPortSpec, ContainerPortSpecs, PORT_FORWARDS_KEY, PortRef,
        PortTunnel, auto_tunnels, check_available, parse_pf, parse_pfs, preferred_ports, to_tunnels,
    };
    use crate::error::EngineError;
    use k8s_openapi::api::core::v1::ContainerPort;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn specs(entries: &[(&str, &str, u16)]) -> ContainerPortSpecs {
        entries
            .iter()
            .map(|(container, name, number)| ContainerPortSpec::new(container, name, *number))
            .collect()
    }

    fn tunnel(address: &str, container: &str, local: u16, remote: u16) -> PortTunnel {
        PortTunnel {
            address: address.to_string(),
            container: container.to_string(),
            local_port: local,
            container_port: remote,
        }
    }

    #[test]
    fn parse_pf_table() {
        let cases = [
            ("c1::4321:1234", "c1", PortRef::Number(1234), Some(4321)),
            ("c1::4321:p1/1234", "c1", PortRef::Named("p1".to_string()), Some(4321)),
            ("c1::p1/1234", "c1", PortRef::Named("p1".to_string()), Some(1234)),
            ("c1::1234", "c1", PortRef::Number(1234), Some(1234)),
            ("1234", "", PortRef::Number(1234), Some(1234)),
            ("4321:1234", "", PortRef::Number(1234), Some(4321)),
            ("c1::p1", "c1", PortRef::Named("p1".to_string()), None),
        ];

        for (raw, container, port, local) in cases {
            let annotation = parse_pf(raw).unwrap_or_else(|error| panic!("{raw}: {error}"));
            assert_eq!(annotation.container, container, "{raw}");
            assert_eq!(annotation.container_port, port, "{raw}");
            assert_eq!(annotation.local_port, local, "{raw}");
        }
    }

    #[test]
    fn parse_pf_rejects_malformed_text() {
        for raw in ["c1:4321:1234", "c1::p1:1234", "c1::", "c1::1:2:3", "c1::80/x", ""] {
            let error = parse_pf(raw).expect_err(raw);
            assert_eq!(
                error.to_string(),
                format!("invalid port-forward specification {raw}")
            );
        }
    }

    #[test]
    fn port_num_needs_a_number() {
        let numeric = parse_pf("c1::4321:1234").expect("parse");
        assert_eq!(numeric.port_num().ok(), Some(1234));
        let named = parse_pf("c1::p1").expect("parse");
        assert!(matches!(named.port_num(), Err(EngineError::NoPortNumber)));
        assert_eq!(
            named.port_num().map_err(|error| error.to_string()),
            Err("no port number assigned".to_string())
        );
    }

    #[test]
    fn annotation_display_uses_resolved_ports() {
        assert_eq!(parse_pf("c1::p1/1234").expect("parse").to_string(), "c1::1234:1234");
        assert_eq!(
            parse_pf("c1::4321:1234/1234").expect("parse").to_string(),
            "c1::4321:1234"
        );
    }

    #[test]
    fn annotation_to_tunnel() {
        let pf = parse_pf("c1::p1/1234").expect("parse");
        assert_eq!(pf.to_tunnel("blee").ok(), Some(tunnel("blee", "c1", 1234, 1234)));
        let pf = parse_pf("c1::4321:1234").expect("parse");
        assert_eq!(pf.to_tunnel("blee").ok(), Some(tunnel("blee", "c1", 4321, 1234)));
    }

    #[test]
    fn annotation_matching() {
        let declared = specs(&[("c1", "", 1234)]);
        assert!(parse_pf("c1::1234").expect("parse").matches(&declared));
        assert!(parse_pf("c1::4321:1234").expect("parse").matches(&declared));
        assert!(!parse_pf("c1::1235").expect("parse").matches(&declared));

        let named = specs(&[("c1", "http", 8080)]);
        assert!(parse_pf("c1::9000:http").expect("parse").matches(&named));
        assert!(!parse_pf("c2::9000:http").expect("parse").matches(&named));
    }

    #[test]
    fn parse_pfs_table() {
        let parsed = parse_pfs(" c1::4321:1234 , c2::6666:6543 ").expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].container, "c1");
        assert_eq!(parsed[1].local_port, Some(6666));
        assert_eq!(parsed[1].container_port, PortRef::Number(6543));

        let plain = parse_pfs("4321:1234, 6666:6543").expect("parse");
        assert!(plain.iter().all(|pf| pf.container.is_empty()));
    }

    #[test]
    fn parse_pfs_fails_atomically() {
        let error = parse_pfs("c1::p1:1234,c2::4321").expect_err("malformed first entry");
        assert_eq!(
            error.to_string(),
            "invalid port-forward specification c1::p1:1234"
        );
        assert!(parse_pfs("c1::1234,c2:4321:1").is_err());
    }

    #[test]
    fn preferred_ports_without_annotation_takes_first_port() {
        let declared = specs(&[("c1", "", 1234), ("c1", "", 8080)]);
        let preferred = preferred_ports(None, &declared).expect("preferred");
        assert_eq!(preferred.len(), 1);
        assert_eq!(
            preferred[0].to_tunnel("localhost").ok(),
            Some(tunnel("localhost", "c1", 1234, 1234))
        );
        assert!(preferred_ports(None, &ContainerPortSpecs::default())
            .expect("preferred")
            .is_empty());
    }

    #[test]
    fn preferred_ports_follow_annotation() {
        let declared = specs(&[("c1", "p1", 1234)]);
        let annotations =
            BTreeMap::from([(PORT_FORWARDS_KEY.to_string(), "c1::4321:1234".to_string())]);
        let preferred = preferred_ports(Some(&annotations), &declared).expect("preferred");
        assert_eq!(
            preferred[0].to_tunnel("localhost").ok(),
            Some(tunnel("localhost", "c1", 4321, 1234))
        );

        let declared = specs(&[("c1", "", 1234)]);
        let annotations =
            BTreeMap::from([(PORT_FORWARDS_KEY.to_string(), "c2::4321:1234".to_string())]);
        assert!(preferred_ports(Some(&annotations), &declared)
            .expect("preferred")
            .is_empty());

        let annotations = BTreeMap::from([(PORT_FORWARDS_KEY.to_string(), "c2:1:2".to_string())]);
        assert!(preferred_ports(Some(&annotations), &declared).is_err());
    }

    #[test]
    fn annotations_to_tunnels() {
        let declared = specs(&[("c2", "p1", 1234)]);
        let single = parse_pfs("c2::4321:1234").expect("parse");
        assert_eq!(
            single.to_tunnels("fred", &declared, |_| true).ok(),
            Some(vec![tunnel("fred", "c2", 4321, 1234)])
        );
        assert!(single
            .to_tunnels("fred", &declared, |_| false)
            .expect("tunnels")
            .is_empty());

        let mixed = parse_pfs("c2::4321:1234,c3::80,8080").expect("parse");
        assert_eq!(
            mixed.to_tunnels("fred", &declared, |_| true).ok(),
            Some(vec![
                tunnel("fred", "c2", 4321, 1234),
                tunnel("fred", "", 8080, 8080),
            ])
        );

        let hosed = parse_pfs("c2::p2").expect("parse");
        assert!(matches!(
            hosed.to_tunnels("fred", &declared, |_| true),
            Err(EngineError::NoPortNumber)
        ));
    }

    #[test]
    fn annotations_to_port_spec() {
        let parsed = parse_pfs("c2::4321:p2/1234").expect("parse");
        let (spec, port) = parsed.to_port_spec(&specs(&[("c2", "", 1234)]));
        assert_eq!(spec, "c2::1234");
        assert_eq!(port, "4321");

        let parsed = parse_pfs("c1::http").expect("parse");
        let (spec, port) = parsed.to_port_spec(&specs(&[("c1", "http", 8080)]));
        assert_eq!((spec.as_str(), port.as_str()), ("c1::8080", "8080"));
    }

    #[test]
    fn form_values_to_tunnels() {
        assert_eq!(
            to_tunnels("blee", "c2::4321:p2/1234", "4321").ok(),
            Some(vec![tunnel("blee", "c2", 4321, 1234)])
        );
        assert_eq!(
            to_tunnels("blee", "c1::5432:2345/2345,c2::4321:p2/1234", "5432,4321").ok(),
            Some(vec![
                tunnel("blee", "c1", 5432, 2345),
                tunnel("blee", "c2", 4321, 1234),
            ])
        );
        assert!(to_tunnels("blee", "c1::80,c2::81", "8080").is_err());
        assert!(to_tunnels("blee", "c1::80", "http").is_err());
    }

    #[test]
    fn container_specs_from_ports_keep_tcp() {
        let ports = vec![
            ContainerPort {
                container_port: 1234,
                name: Some("p1".to_string()),
                ..ContainerPort::default()
            },
            ContainerPort {
                container_port: 53,
                protocol: Some("UDP".to_string()),
                ..ContainerPort::default()
            },
            ContainerPort {
                container_port: 8080,
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            },
        ];
        let specs = ContainerPortSpecs::from_container_ports("c1", &ports);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].to_string(), "c1::1234(p1)");
        assert_eq!(specs.dump(), "c1::1234(p1)\nc1::8080");
        assert_eq!(
            specs.to_tunnels("localhost"),
            vec![
                tunnel("localhost", "c1", 1234, 1234),
                tunnel("localhost", "c1", 8080, 8080),
            ]
        );
    }

    #[test]
    fn container_specs_match_raw_entries() {
        let declared = specs(&[("c1", "p1", 1234)]);
        assert!(declared.matches_spec("c1::1234"));
        assert!(declared.matches_spec("c1::1234:4321"));
        assert!(!declared.matches_spec("c1::4321"));
        assert!(declared.matches_spec("4321"));
        assert!(ContainerPortSpecs::default().matches_spec("c9::1"));
    }

    #[test]
    fn form_entries_are_checked_as_typed() {
        let declared = specs(&[("c1", "", 8080)]);
        assert_eq!(declared.undeclared("8080"), None);
        assert_eq!(declared.undeclared("c1::8080"), None);
        assert_eq!(declared.undeclared("c1::8080, c2::80"), Some("c2::80"));

        let tunnels = to_tunnels("localhost", "8080", "9090").expect("tunnels");
        assert_eq!(tunnels, vec![tunnel("localhost", "", 9090, 8080)]);
    }

    #[test]
    fn bound_ports_are_reported_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let taken = listener.local_addr().expect("addr").port();
        let error = check_available(&[tunnel("127.0.0.1", "c1", taken, 80)]).expect_err("taken");
        assert!(matches!(error, EngineError::PortUnavailable { port, .. } if port == taken));
    }

    #[test]
    fn auto_annotation_skips_busy_ports() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let taken = listener.local_addr().expect("addr").port();
        let declared = specs(&[("c1", "http", 8080)]);
        assert_eq!(auto_tunnels(None, &declared, "127.0.0.1").expect("none"), None);

        let mut annotations = BTreeMap::new();
        annotations.insert(
            AUTO_PORT_FORWARDS_KEY.to_string(),
            format!("c1::{taken}:8080"),
        );
        let tunnels = auto_tunnels(Some(&annotations), &declared, "127.0.0.1")
            .expect("parse")
            .expect("annotated");
        assert!(tunnels.is_empty());

        annotations.insert(AUTO_PORT_FORWARDS_KEY.to_string(), "c1::http".to_string());
        assert!(auto_tunnels(Some(&annotations), &declared, "127.0.0.1").is_err());
    }

    fn annotation_text() -> impl Strategy<Value = String> {
        let port = prop_oneof![
            (1u16..=u16::MAX).prop_map(|number| number.to_string()),
            ("[a-z][a-z0-9-]{0,6}", 1u16..=u16::MAX)
                .prop_map(|(name, number)| format!("{name}/{number}")),
        ];
        ("[a-z][a-z0-9]{0,5}", proptest::option::of(1u16..=u16::MAX), port).prop_map(
            |(container, local, port)| match local {
                Some(local) => format!("{container}::{local}:{port}"),
                None => format!("{container}::{port}"),
            },
        )
    }

    proptest! {
        #[test]
        fn annotations_survive_a_round_trip(raw in annotation_text()) {
            let parsed = parse_pf(&raw).expect("valid annotation");
            let reparsed = parse_pf(&parsed.to_string()).expect("rendered annotation");
            prop_assert_eq!(&reparsed.container, &parsed.container);
            prop_assert_eq!(reparsed.local_port, parsed.local_port);
            prop_assert_eq!(reparsed.port_num().ok(), parsed.port_num().ok());
        }
    }
}

//! Connectivity candidate lines: formatting and validation.
//!
//! Candidates travel between peers as opaque `candidate:` strings inside
//! `ice-candidate` signals. The engine never interprets them beyond checking
//! they are well formed; the simulated media engine uses these helpers to
//! produce and accept them.

use anyhow::{bail, Context, Result};

use super::rtc::IceCandidateInit;

/// Candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
        }
    }

    /// RFC 8445 type preference.
    fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

/// One parsed candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
    pub related: Option<(String, u16)>,
}

impl Candidate {
    pub fn new(kind: CandidateType, address: &str, port: u16) -> Self {
        Self {
            foundation: format!("{}", 1 + kind.preference() % 7),
            component: 1,
            protocol: "udp".into(),
            priority: priority(kind, 65535, 1),
            address: address.to_string(),
            port,
            kind,
            related: None,
        }
    }

    /// `candidate:` line as carried in signals (no `a=` prefix).
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        );
        if let Some((ref addr, port)) = self.related {
            line.push_str(&format!(" raddr {} rport {}", addr, port));
        }
        line
    }

    /// Wrap as a signal payload for the given media section.
    pub fn to_init(&self, mid: &str, m_line_index: u16) -> IceCandidateInit {
        IceCandidateInit {
            candidate: self.to_line(),
            sdp_mid: Some(mid.to_string()),
            sdp_m_line_index: Some(m_line_index),
        }
    }
}

/// RFC 8445 §5.1.2.1 candidate priority.
pub fn priority(kind: CandidateType, local_preference: u32, component: u8) -> u32 {
    (kind.preference() << 24) + (local_preference.min(65535) << 8) + (256 - component as u32)
}

/// Parse a `candidate:` (or `a=candidate:`) line.
pub fn parse(line: &str) -> Result<Candidate> {
    let line = line.trim();
    let body = line
        .strip_prefix("a=")
        .unwrap_or(line)
        .strip_prefix("candidate:")
        .with_context(|| format!("not a candidate line: {}", line))?;

    let mut fields = body.split_whitespace();
    let mut next = |what: &str| {
        fields
            .next()
            .with_context(|| format!("candidate line missing {}: {}", what, line))
    };

    let foundation = next("foundation")?.to_string();
    let component = next("component")?.parse().context("bad component")?;
    let protocol = next("protocol")?.to_lowercase();
    if protocol != "udp" && protocol != "tcp" {
        bail!("unsupported transport: {}", protocol);
    }
    let priority = next("priority")?.parse().context("bad priority")?;
    let address = next("address")?.to_string();
    let port = next("port")?.parse().context("bad port")?;
    if next("typ")? != "typ" {
        bail!("expected 'typ' keyword: {}", line);
    }
    let kind = match next("type")? {
        "host" => CandidateType::Host,
        "srflx" | "prflx" => CandidateType::ServerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let rest: Vec<&str> = fields.collect();
    let mut raddr = None;
    let mut rport = None;
    for pair in rest.chunks(2) {
        match pair {
            ["raddr", v] => raddr = Some(v.to_string()),
            ["rport", v] => rport = Some(v.parse().context("bad rport")?),
            _ => {}
        }
    }

    Ok(Candidate {
        foundation,
        component,
        protocol,
        priority,
        address,
        port,
        kind,
        related: raddr.zip(rport),
    })
}

//! Upload-pack negotiation parsing and request fingerprinting.
//!
//! The parsed form is canonical: two clients asking for the same objects
//! with the same capabilities produce the same fingerprint regardless of
//! line ordering, so the fingerprint can key a content-addressed cache of
//! upload-pack responses.

use std::collections::BTreeSet;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::pkt::{Pkt, decode_pkt_lines};

/// Capability prefixes that do not change the bytes upload-pack produces.
/// They are excluded from the canonical form so e.g. different git client
/// versions still share a cache entry.
const IGNORED_CAP_PREFIXES: &[&str] = &["agent=", "session-id="];

#[derive(Debug, Clone, Default)]
pub struct UploadPackInput {
    /// Original request body, passed to `git-upload-pack` verbatim.
    pub input: Bytes,
    pub wants: BTreeSet<String>,
    pub haves: BTreeSet<String>,
    pub caps: BTreeSet<String>,
    pub done: bool,
    /// `filter <spec>` lines (partial clone).
    pub filter: bool,
    /// Raw `deepen` / `deepen-since` / `deepen-not` lines.
    pub deepens: BTreeSet<String>,
    pub shallows: BTreeSet<String>,
    pub parse_error: bool,
    /// 40-hex fingerprint of the canonical negotiation; empty on parse error.
    pub hash: String,
    pub protocol_version: u8,
}

impl UploadPackInput {
    pub fn parse(input: Bytes, protocol_version: u8) -> Self {
        let mut parsed = UploadPackInput {
            input,
            protocol_version,
            ..Default::default()
        };

        let pkts = match decode_pkt_lines(&parsed.input) {
            Ok(pkts) => pkts,
            Err(err) => {
                tracing::debug!(%err, "upload-pack input does not frame");
                parsed.parse_error = true;
                return parsed;
            }
        };

        let mut first_want = true;
        for pkt in &pkts {
            let Pkt::Data(line) = pkt else { continue };
            let Ok(line) = std::str::from_utf8(line) else {
                parsed.parse_error = true;
                break;
            };
            let line = line.trim_end_matches('\n');
            if let Some(rest) = line.strip_prefix("want ") {
                let mut tokens = rest.split(' ');
                match tokens.next() {
                    Some(oid) if is_hex_oid(oid) => {
                        parsed.wants.insert(oid.to_string());
                    }
                    _ => {
                        parsed.parse_error = true;
                        break;
                    }
                }
                // Protocol v1 carries the capability list after the first
                // want oid; later want lines must be bare.
                if first_want {
                    for cap in tokens.filter(|t| !t.is_empty()) {
                        parsed.caps.insert(cap.to_string());
                    }
                    first_want = false;
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("have ") {
                if !is_hex_oid(rest) {
                    parsed.parse_error = true;
                    break;
                }
                parsed.haves.insert(rest.to_string());
                continue;
            }
            if let Some(rest) = line.strip_prefix("shallow ") {
                if !is_hex_oid(rest) {
                    parsed.parse_error = true;
                    break;
                }
                parsed.shallows.insert(rest.to_string());
                continue;
            }
            if line.starts_with("deepen") {
                parsed.deepens.insert(line.to_string());
                continue;
            }
            if let Some(spec) = line.strip_prefix("filter ") {
                parsed.filter = true;
                parsed.caps.insert(format!("filter {spec}"));
                continue;
            }
            if line == "done" {
                parsed.done = true;
                continue;
            }
            if line.starts_with("command=") {
                // v2 preamble; only fetch reaches this handler
                continue;
            }
            // v2 argument section: bare capability tokens and key=value pairs
            if !line.contains(' ') && !line.is_empty() {
                parsed.caps.insert(line.to_string());
            }
        }

        if !parsed.parse_error {
            parsed.hash = parsed.fingerprint();
        }
        parsed
    }

    /// The leading input bytes kept for diagnostics on parse errors.
    pub fn input_prefix(&self) -> &[u8] {
        &self.input[..self.input.len().min(128)]
    }

    /// A request is served from the pack cache only when the negotiation is
    /// final (`done`), framed (side-band-64k, implicit in protocol v2), and
    /// its output is a pure function of the canonical form: shallow and
    /// partial-clone negotiations are excluded.
    pub fn can_be_cached(&self) -> bool {
        !self.parse_error
            && !self.wants.is_empty()
            && self.done
            && (self.caps.contains("side-band-64k") || self.protocol_version == 2)
            && !self.filter
            && self.deepens.is_empty()
            && self.shallows.is_empty()
    }

    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"version=");
        hasher.update([self.protocol_version]);
        for want in &self.wants {
            hasher.update(b"\nwant ");
            hasher.update(want.as_bytes());
        }
        for have in &self.haves {
            hasher.update(b"\nhave ");
            hasher.update(have.as_bytes());
        }
        for cap in &self.caps {
            if IGNORED_CAP_PREFIXES.iter().any(|p| cap.starts_with(p)) {
                continue;
            }
            hasher.update(b"\ncap ");
            hasher.update(cap.as_bytes());
        }
        for shallow in &self.shallows {
            hasher.update(b"\nshallow ");
            hasher.update(shallow.as_bytes());
        }
        for deepen in &self.deepens {
            hasher.update(b"\n");
            hasher.update(deepen.as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..40].to_string()
    }
}

fn is_hex_oid(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

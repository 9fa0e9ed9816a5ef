//! Network security config: make the app trust user-installed CAs.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{info, warn};

use super::android::{ensure_nsc_reference, network_security_config_ref};
use super::xml::{attr_value, end, Rewriter};
use crate::error::{PatcherError, Result};

pub const NSC_DIR: &str = "res/xml";
pub const DEFAULT_NSC_NAME: &str = "network_security_config";
const XML_REFERENCE_PREFIX: &str = "@xml/";
const CONTEXT: &str = "network security config";

const ROOT: &[u8] = b"network-security-config";
const ANCHOR_SOURCES: [&str; 2] = ["system", "user"];

/// Policy written when the app has none.
pub fn default_policy() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<network-security-config>
    <base-config>
        <trust-anchors>
            <certificates src="system" />
            <certificates src="user" />
        </trust-anchors>
    </base-config>
</network-security-config>
"#
    .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Root,
    Base,
    Anchors,
    Certificates,
    Other,
}

/// Tags elements with their role. Only the first `<base-config>` and its
/// first `<trust-anchors>` count.
#[derive(Default)]
struct Scope {
    stack: Vec<Role>,
    base_seen: bool,
    anchors_seen: bool,
}

impl Scope {
    fn classify(&mut self, name: &[u8]) -> Role {
        match (self.stack.last(), name) {
            (None, ROOT) => Role::Root,
            (Some(Role::Root), b"base-config") if !self.base_seen => {
                self.base_seen = true;
                Role::Base
            }
            (Some(Role::Base), b"trust-anchors") if !self.anchors_seen => {
                self.anchors_seen = true;
                Role::Anchors
            }
            (Some(Role::Anchors), b"certificates") => Role::Certificates,
            _ => Role::Other,
        }
    }
}

#[derive(Debug, Default)]
struct PolicyFacts {
    has_root: bool,
    has_base: bool,
    has_anchors: bool,
    sources: Vec<String>,
}

impl PolicyFacts {
    fn missing_sources(&self) -> Vec<&'static str> {
        ANCHOR_SOURCES
            .into_iter()
            .filter(|src| !self.sources.iter().any(|s| s == src))
            .collect()
    }
}

fn analyze(xml: &str) -> Result<PolicyFacts> {
    let mut reader = Reader::from_str(xml);
    let mut scope = Scope::default();
    let mut facts = PolicyFacts::default();

    loop {
        let event = reader.read_event().map_err(|e| PatcherError::xml(CONTEXT, e))?;
        let (element, is_empty) = match &event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => {
                scope.stack.pop();
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        let role = scope.classify(element.name().as_ref());
        match role {
            Role::Root => facts.has_root = true,
            Role::Base => facts.has_base = true,
            Role::Anchors => facts.has_anchors = true,
            Role::Certificates => {
                if let Some(src) = attr_value(element, b"src", CONTEXT)? {
                    facts.sources.push(src.trim().to_string());
                }
            }
            Role::Other => {}
        }
        if !is_empty {
            scope.stack.push(role);
        }
    }

    if !facts.has_root {
        return Err(PatcherError::xml(CONTEXT, "missing <network-security-config> root"));
    }
    Ok(facts)
}

fn certificates(sources: &[&str]) -> Vec<Event<'static>> {
    sources
        .iter()
        .map(|src| {
            let mut cert = BytesStart::new("certificates");
            cert.push_attribute(("src", *src));
            Event::Empty(cert)
        })
        .collect()
}

fn anchors_block() -> Vec<Event<'static>> {
    let mut events = vec![Event::Start(BytesStart::new("trust-anchors"))];
    events.extend(certificates(&ANCHOR_SOURCES));
    events.push(end("trust-anchors"));
    events
}

fn base_block() -> Vec<Event<'static>> {
    let mut events = vec![Event::Start(BytesStart::new("base-config"))];
    events.extend(anchors_block());
    events.push(end("base-config"));
    events
}

/// Ensure the base config trusts both system and user CAs.
///
/// Only missing pieces are inserted; a policy that already trusts both is
/// returned unchanged.
pub fn merge_user_trust(xml: &str) -> Result<String> {
    let facts = analyze(xml)?;
    let missing = facts.missing_sources();
    let insertion_for = |role: Role| -> Option<Vec<Event<'static>>> {
        match role {
            Role::Root if !facts.has_base => Some(base_block()),
            Role::Base if !facts.has_anchors => Some(anchors_block()),
            Role::Anchors if !missing.is_empty() => Some(certificates(&missing)),
            _ => None,
        }
    };

    if facts.has_base && facts.has_anchors && missing.is_empty() {
        return Ok(xml.to_string());
    }

    let mut rw = Rewriter::new(xml, CONTEXT);
    let mut scope = Scope::default();
    loop {
        match rw.next()? {
            Event::Eof => break,
            Event::Start(e) => {
                let role = scope.classify(e.name().as_ref());
                scope.stack.push(role);
                rw.write(Event::Start(e))?;
            }
            Event::Empty(e) => {
                let role = scope.classify(e.name().as_ref());
                match insertion_for(role) {
                    Some(children) => {
                        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        rw.write(Event::Start(e))?;
                        for child in children {
                            rw.write(child)?;
                        }
                        rw.write(end(&name))?;
                    }
                    None => rw.write(Event::Empty(e))?,
                }
            }
            Event::End(e) => {
                if let Some(children) = scope.stack.pop().and_then(insertion_for) {
                    rw.insert_children(children)?;
                }
                rw.write(Event::End(e))?;
            }
            event => rw.write(event)?,
        }
    }
    rw.finish()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustPolicyOutcome {
    pub path: PathBuf,
    /// The app had no policy at that path and a default one was written.
    pub created: bool,
}

/// Make the decoded app trust user CAs: merge into (or create) its policy
/// file, then make sure the manifest points at it.
pub fn patch_trust_policy(decoded_dir: &Path) -> Result<TrustPolicyOutcome> {
    let manifest_path = decoded_dir.join("AndroidManifest.xml");
    let manifest = fs::read_to_string(&manifest_path)
        .map_err(|e| PatcherError::from_io_error(&manifest_path, e))?;

    let (path, reference) = resolve_policy(decoded_dir, &manifest)?;
    let created = if path.is_file() {
        let current =
            fs::read_to_string(&path).map_err(|e| PatcherError::from_io_error(&path, e))?;
        let merged = merge_user_trust(&current)?;
        if merged != current {
            fs::write(&path, merged).map_err(|e| PatcherError::from_io_error(&path, e))?;
        }
        false
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PatcherError::from_io_error(parent, e))?;
        }
        fs::write(&path, default_policy()).map_err(|e| PatcherError::from_io_error(&path, e))?;
        true
    };

    let updated = ensure_nsc_reference(&manifest, &reference)?;
    if updated != manifest {
        fs::write(&manifest_path, updated)
            .map_err(|e| PatcherError::from_io_error(&manifest_path, e))?;
    }

    info!(
        "Network security config {} to trust user CAs",
        if created { "created" } else { "updated" }
    );
    Ok(TrustPolicyOutcome { path, created })
}

/// The policy file the app already uses, or the default location.
fn resolve_policy(decoded_dir: &Path, manifest: &str) -> Result<(PathBuf, String)> {
    let default = || {
        (
            decoded_dir.join(NSC_DIR).join(format!("{DEFAULT_NSC_NAME}.xml")),
            format!("{XML_REFERENCE_PREFIX}{DEFAULT_NSC_NAME}"),
        )
    };

    match network_security_config_ref(manifest)? {
        Some(existing) => match existing.strip_prefix(XML_REFERENCE_PREFIX) {
            Some(name) if !name.is_empty() && !name.contains(['/', '\\']) => Ok((
                decoded_dir.join(NSC_DIR).join(format!("{name}.xml")),
                existing.clone(),
            )),
            _ => {
                warn!("manifest references unsupported network security config '{existing}'");
                Ok(default())
            }
        },
        None => Ok(default()),
    }
}

//! IPA re-signing: entitlements from the provisioning profile, then
//! codesign inside-out (frameworks, extensions, app).

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use plist::Value;
use tracing::{debug, info};

use crate::config::IpaSigning;
use crate::error::{PatcherError, Result};
use crate::toolchain::Toolchain;

pub const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";
const AD_HOC_IDENTITY: &str = "-";
const ENTITLEMENTS_KEY: &str = "Entitlements";

const XML_START: &[u8] = b"<?xml";
const PLIST_END: &[u8] = b"</plist>";

/// One codesign invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignTarget {
    pub path: PathBuf,
    pub with_entitlements: bool,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The XML plist embedded in a CMS-signed provisioning profile.
///
/// Profiles carry their payload as plain bytes inside the signed data, so
/// the document can be sliced out without a CMS parser.
pub fn extract_plist_payload(profile: &[u8]) -> Option<&[u8]> {
    let start = find(profile, XML_START)?;
    let end = find(&profile[start..], PLIST_END)? + start + PLIST_END.len();
    Some(&profile[start..end])
}

/// `Entitlements` dictionary of a decoded profile plist.
pub fn extract_entitlements(profile_plist: &[u8]) -> Result<Value> {
    let value = Value::from_reader_xml(Cursor::new(profile_plist))
        .map_err(|e| PatcherError::Entitlements(format!("profile is not a valid plist: {e}")))?;
    value
        .as_dictionary()
        .and_then(|dict| dict.get(ENTITLEMENTS_KEY))
        .filter(|v| v.as_dictionary().is_some())
        .cloned()
        .ok_or_else(|| PatcherError::Entitlements("no Entitlements dictionary in profile".into()))
}

/// Embed `profile` in the app and write its entitlements to `out`.
pub fn prepare_entitlements(
    profile: &Path,
    app_dir: &Path,
    out: &Path,
    toolchain: &dyn Toolchain,
) -> Result<PathBuf> {
    let embedded = app_dir.join(EMBEDDED_PROFILE);
    fs::copy(profile, &embedded).map_err(|e| PatcherError::from_io_error(&embedded, e))?;

    let raw = fs::read(profile).map_err(|e| PatcherError::from_io_error(profile, e))?;
    let entitlements = match extract_plist_payload(&raw) {
        Some(payload) => extract_entitlements(payload)?,
        None => {
            debug!("no inline plist in profile, decoding with security cms");
            let decoded = toolchain.decode_profile(profile)?;
            extract_entitlements(&decoded)?
        }
    };

    entitlements
        .to_file_xml(out)
        .map_err(|e| PatcherError::from_plist_error(out, e))?;
    debug!(path = %out.display(), "wrote entitlements");
    Ok(out.to_path_buf())
}

fn sorted_children(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut children = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PatcherError::from_io_error(dir, e))? {
        let path = entry.map_err(|e| PatcherError::from_io_error(dir, e))?.path();
        if keep(&path) {
            children.push(path);
        }
    }
    children.sort();
    Ok(children)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// Codesign order for `app_dir`: nested code first, the app last.
pub fn signing_targets(app_dir: &Path) -> Result<Vec<SignTarget>> {
    let mut targets = Vec::new();

    for path in sorted_children(&app_dir.join("Frameworks"), |p| {
        has_extension(p, "framework") || has_extension(p, "dylib")
    })? {
        targets.push(SignTarget {
            path,
            with_entitlements: false,
        });
    }
    for path in sorted_children(&app_dir.join("PlugIns"), |p| has_extension(p, "appex"))? {
        targets.push(SignTarget {
            path,
            with_entitlements: true,
        });
    }
    targets.push(SignTarget {
        path: app_dir.to_path_buf(),
        with_entitlements: true,
    });
    Ok(targets)
}

/// Re-sign the bundle. Returns how many codesign runs were made.
pub fn sign_app(
    app_dir: &Path,
    signing: &IpaSigning,
    entitlements_out: &Path,
    toolchain: &dyn Toolchain,
) -> Result<usize> {
    let (identity, entitlements) = match signing {
        IpaSigning::Identity { identity, profile } => {
            let entitlements = prepare_entitlements(profile, app_dir, entitlements_out, toolchain)?;
            (identity.as_str(), Some(entitlements))
        }
        IpaSigning::AdHoc => (AD_HOC_IDENTITY, None),
    };

    let targets = signing_targets(app_dir)?;
    for target in &targets {
        let entitlements = entitlements
            .as_deref()
            .filter(|_| target.with_entitlements);
        debug!(path = %target.path.display(), "codesign");
        toolchain.codesign(&target.path, identity, entitlements)?;
    }

    match signing {
        IpaSigning::Identity { identity, .. } => {
            info!("Signed {} item(s) with '{identity}'", targets.len())
        }
        IpaSigning::AdHoc => info!("Ad-hoc signed {} item(s)", targets.len()),
    }
    Ok(targets.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::KeystoreCredential;
    use std::cell::RefCell;
    use tempfile::TempDir;

    const PROFILE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Name</key>
    <string>Dev Profile</string>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key>
        <string>TEAM.com.acme.app</string>
        <key>get-task-allow</key>
        <true/>
    </dict>
</dict>
</plist>"#;

    fn cms_wrapped(payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x30, 0x80, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
        data.extend_from_slice(&[0xa0, 0x80, 0x30, 0x80, 0x02, 0x01, 0x01]);
        data.extend_from_slice(payload);
        data.extend_from_slice(&[0x00, 0x00, 0xa0, 0x82, 0x0e, 0x3f, 0x30, 0x82]);
        data
    }

    #[derive(Default)]
    struct RecordingToolchain {
        signed: RefCell<Vec<(PathBuf, String, bool)>>,
        decoded: RefCell<usize>,
    }

    impl Toolchain for RecordingToolchain {
        fn decode_apk(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn build_apk(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn zipalign(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn sign_apk(&self, _: &Path, _: &Path, _: &KeystoreCredential) -> Result<()> {
            unreachable!()
        }
        fn generate_debug_keystore(&self, _: &KeystoreCredential) -> Result<()> {
            unreachable!()
        }
        fn codesign(&self, target: &Path, identity: &str, entitlements: Option<&Path>) -> Result<()> {
            self.signed
                .borrow_mut()
                .push((target.to_path_buf(), identity.to_string(), entitlements.is_some()));
            Ok(())
        }
        fn decode_profile(&self, _: &Path) -> Result<Vec<u8>> {
            *self.decoded.borrow_mut() += 1;
            Ok(PROFILE_PLIST.as_bytes().to_vec())
        }
    }

    fn app_fixture(root: &Path) -> anyhow::Result<PathBuf> {
        let app = root.join("Payload/Demo.app");
        fs::create_dir_all(app.join("Frameworks/AutoProxy.framework"))?;
        fs::create_dir_all(app.join("Frameworks/Alamofire.framework"))?;
        fs::write(app.join("Frameworks/libswiftCore.dylib"), b"")?;
        fs::write(app.join("Frameworks/README.txt"), b"")?;
        fs::create_dir_all(app.join("PlugIns/Share.appex"))?;
        Ok(app)
    }

    #[test]
    fn payload_is_sliced_out_of_cms() {
        let wrapped = cms_wrapped(PROFILE_PLIST.as_bytes());
        let payload = extract_plist_payload(&wrapped).unwrap();
        assert_eq!(payload, PROFILE_PLIST.as_bytes());

        let entitlements = extract_entitlements(payload).unwrap();
        let dict = entitlements.as_dictionary().unwrap();
        assert_eq!(
            dict.get("application-identifier").and_then(Value::as_string),
            Some("TEAM.com.acme.app")
        );
        assert!(extract_plist_payload(b"\x30\x82 binary only").is_none());
    }

    #[test]
    fn missing_entitlements_is_an_error() {
        let plist = br#"<?xml version="1.0"?><plist version="1.0"><dict><key>Name</key><string>x</string></dict></plist>"#;
        assert!(matches!(
            extract_entitlements(plist),
            Err(PatcherError::Entitlements(_))
        ));
    }

    #[test]
    fn signing_order_is_inside_out() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let app = app_fixture(temp.path())?;
        let targets = signing_targets(&app)?;
        let names: Vec<_> = targets
            .iter()
            .map(|t| (t.path.file_name().unwrap().to_string_lossy().into_owned(), t.with_entitlements))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Alamofire.framework".to_string(), false),
                ("AutoProxy.framework".to_string(), false),
                ("libswiftCore.dylib".to_string(), false),
                ("Share.appex".to_string(), true),
                ("Demo.app".to_string(), true),
            ]
        );
        Ok(())
    }

    #[test]
    fn identity_signing_embeds_profile() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let app = app_fixture(temp.path())?;
        let profile = temp.path().join("dev.mobileprovision");
        fs::write(&profile, cms_wrapped(PROFILE_PLIST.as_bytes()))?;
        let entitlements = temp.path().join("entitlements.plist");

        let toolchain = RecordingToolchain::default();
        let signing = IpaSigning::Identity {
            identity: "Apple Development: Dev".into(),
            profile: profile.clone(),
        };
        let count = sign_app(&app, &signing, &entitlements, &toolchain)?;

        assert_eq!(count, 5);
        assert_eq!(fs::read(app.join(EMBEDDED_PROFILE))?, fs::read(&profile)?);
        assert_eq!(*toolchain.decoded.borrow(), 0);
        let written = Value::from_file(&entitlements)?;
        assert!(written.as_dictionary().unwrap().contains_key("get-task-allow"));

        let signed = toolchain.signed.borrow();
        assert!(signed.iter().all(|(_, id, _)| id == "Apple Development: Dev"));
        assert_eq!(signed.last().unwrap().0, app);
        assert!(signed.last().unwrap().2);
        assert!(!signed[0].2);
        Ok(())
    }

    #[test]
    fn falls_back_to_security_cms() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let app = app_fixture(temp.path())?;
        let profile = temp.path().join("opaque.mobileprovision");
        fs::write(&profile, [0x30, 0x82, 0x01, 0x00, 0xde, 0xad])?;

        let toolchain = RecordingToolchain::default();
        let signing = IpaSigning::Identity {
            identity: "X".into(),
            profile,
        };
        sign_app(&app, &signing, &temp.path().join("ent.plist"), &toolchain)?;
        assert_eq!(*toolchain.decoded.borrow(), 1);
        Ok(())
    }

    #[test]
    fn ad_hoc_uses_dash_without_entitlements() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let app = app_fixture(temp.path())?;
        let toolchain = RecordingToolchain::default();

        sign_app(&app, &IpaSigning::AdHoc, &temp.path().join("ent.plist"), &toolchain)?;
        let signed = toolchain.signed.borrow();
        assert_eq!(signed.len(), 5);
        assert!(signed.iter().all(|(_, id, ent)| id == "-" && !ent));
        assert!(!app.join(EMBEDDED_PROFILE).exists());
        Ok(())
    }
}

//! AndroidManifest.xml editing

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use tracing::debug;

use super::xml::{attr_value, end, with_attribute, Rewriter};
use crate::error::{PatcherError, Result};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
/// ContentProvider that boots the SDK before `Application.onCreate`.
pub const PROVIDER_CLASS: &str = "com.guthyerrz.autoproxy.AutoProxyInitializer";
pub const AUTHORITY_SUFFIX: &str = ".autoproxy-init";

const CONTEXT: &str = "AndroidManifest.xml";
const DEFAULT_PREFIX: &str = "android";

#[derive(Debug, Default)]
struct ManifestFacts {
    package: Option<String>,
    /// Prefix bound to [`ANDROID_NS`] on `<manifest>`, if any.
    android_prefix: Option<String>,
    has_application: bool,
    provider_present: bool,
    network_security_config: Option<String>,
}

fn analyze(xml: &str) -> Result<ManifestFacts> {
    let mut reader = NsReader::from_str(xml);
    let mut facts = ManifestFacts::default();
    let mut seen_manifest = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| PatcherError::xml(CONTEXT, e))?;
        let element = match &event {
            Event::Start(e) | Event::Empty(e) => e,
            Event::Eof => break,
            _ => continue,
        };

        match element.name().as_ref() {
            b"manifest" if !seen_manifest => {
                seen_manifest = true;
                facts.package = attr_value(element, b"package", CONTEXT)?;
                for attr in element.attributes() {
                    let attr = attr.map_err(|e| PatcherError::xml(CONTEXT, e))?;
                    if let Some(prefix) = attr.key.as_ref().strip_prefix(b"xmlns:") {
                        if attr.value.as_ref() == ANDROID_NS.as_bytes() {
                            facts.android_prefix = Some(String::from_utf8_lossy(prefix).into_owned());
                        }
                    }
                }
            }
            b"application" if !facts.has_application => {
                facts.has_application = true;
                // A blank reference points nowhere, treat it as absent.
                facts.network_security_config =
                    android_attr(&reader, element, b"networkSecurityConfig")?
                        .filter(|value| !value.trim().is_empty());
            }
            b"provider" => {
                if android_attr(&reader, element, b"name")?.as_deref() == Some(PROVIDER_CLASS) {
                    facts.provider_present = true;
                }
            }
            _ => {}
        }
    }

    if !seen_manifest {
        return Err(PatcherError::xml(CONTEXT, "missing <manifest> root element"));
    }
    Ok(facts)
}

/// Value of the attribute whose namespace resolves to [`ANDROID_NS`],
/// whatever prefix the document uses for it.
fn android_attr(
    reader: &NsReader<&[u8]>,
    element: &BytesStart<'_>,
    local: &[u8],
) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| PatcherError::xml(CONTEXT, e))?;
        let (ns, name) = reader.resolve_attribute(attr.key);
        let in_android_ns =
            matches!(ns, ResolveResult::Bound(Namespace(uri)) if uri == ANDROID_NS.as_bytes());
        if in_android_ns && name.as_ref() == local {
            let value = attr
                .unescape_value()
                .map_err(|e| PatcherError::xml(CONTEXT, e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// The `package` attribute of `<manifest>`.
pub fn read_package(xml: &str) -> Result<String> {
    analyze(xml)?
        .package
        .filter(|p| !p.trim().is_empty())
        .ok_or(PatcherError::MissingPackageAttribute)
}

/// Current `android:networkSecurityConfig` of `<application>`.
pub fn network_security_config_ref(xml: &str) -> Result<Option<String>> {
    Ok(analyze(xml)?.network_security_config)
}

/// Register the SDK's ContentProvider as the last child of `<application>`.
pub fn patch_manifest(xml: &str) -> Result<String> {
    let facts = analyze(xml)?;
    let package = facts
        .package
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or(PatcherError::MissingPackageAttribute)?;
    if facts.provider_present {
        return Err(PatcherError::AlreadyPatched(format!(
            "ContentProvider '{PROVIDER_CLASS}' already exists in manifest."
        )));
    }
    if !facts.has_application {
        return Err(PatcherError::MissingApplicationElement);
    }

    let prefix = facts.android_prefix.as_deref().unwrap_or(DEFAULT_PREFIX);
    let mut provider = BytesStart::new("provider");
    provider.push_attribute((format!("{prefix}:name").as_str(), PROVIDER_CLASS));
    provider.push_attribute((
        format!("{prefix}:authorities").as_str(),
        format!("{package}{AUTHORITY_SUFFIX}").as_str(),
    ));
    provider.push_attribute((format!("{prefix}:exported").as_str(), "false"));

    debug!(package, prefix, "adding provider to manifest");
    rewrite(
        xml,
        &ManifestEdits {
            provider: Some(provider),
            nsc_reference: None,
            declare_ns: facts.android_prefix.is_none(),
        },
    )
}

/// Point `<application>` at a network security config, keeping any
/// reference that is already there.
pub fn ensure_nsc_reference(xml: &str, reference: &str) -> Result<String> {
    let facts = analyze(xml)?;
    if !facts.has_application {
        return Err(PatcherError::MissingApplicationElement);
    }
    if facts.network_security_config.is_some() {
        return Ok(xml.to_string());
    }

    let prefix = facts.android_prefix.as_deref().unwrap_or(DEFAULT_PREFIX);
    rewrite(
        xml,
        &ManifestEdits {
            provider: None,
            nsc_reference: Some((format!("{prefix}:networkSecurityConfig"), reference.to_string())),
            declare_ns: facts.android_prefix.is_none(),
        },
    )
}

struct ManifestEdits {
    provider: Option<BytesStart<'static>>,
    nsc_reference: Option<(String, String)>,
    declare_ns: bool,
}

fn rewrite(xml: &str, edits: &ManifestEdits) -> Result<String> {
    let mut rw = Rewriter::new(xml, CONTEXT);
    let mut manifest_done = false;
    let mut in_application = false;
    let mut application_done = false;
    let mut depth = 0usize;

    loop {
        match rw.next()? {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == b"manifest" && !manifest_done => {
                manifest_done = true;
                rw.write(Event::Start(declare(&e, edits)))?;
            }
            Event::Empty(e) if e.name().as_ref() == b"manifest" && !manifest_done => {
                manifest_done = true;
                rw.write(Event::Empty(declare(&e, edits)))?;
            }
            Event::Start(e) if e.name().as_ref() == b"application" && !application_done => {
                in_application = true;
                application_done = true;
                rw.write(Event::Start(reference(&e, edits)))?;
            }
            Event::Empty(e) if e.name().as_ref() == b"application" && !application_done => {
                application_done = true;
                match &edits.provider {
                    Some(provider) => {
                        rw.write(Event::Start(reference(&e, edits)))?;
                        rw.write(Event::Empty(provider.clone()))?;
                        rw.write(end("application"))?;
                    }
                    None => rw.write(Event::Empty(reference(&e, edits)))?,
                }
            }
            Event::Start(e) if in_application => {
                depth += 1;
                rw.write(Event::Start(e))?;
            }
            Event::End(e) if in_application => {
                if depth == 0 {
                    in_application = false;
                    if let Some(provider) = &edits.provider {
                        rw.insert_children(vec![Event::Empty(provider.clone())])?;
                    }
                } else {
                    depth -= 1;
                }
                rw.write(Event::End(e))?;
            }
            event => rw.write(event)?,
        }
    }

    rw.finish()
}

fn declare(manifest: &BytesStart<'_>, edits: &ManifestEdits) -> BytesStart<'static> {
    if edits.declare_ns {
        with_attribute(manifest, "xmlns:android", ANDROID_NS)
    } else {
        manifest.to_owned()
    }
}

fn reference(application: &BytesStart<'_>, edits: &ManifestEdits) -> BytesStart<'static> {
    match &edits.nsc_reference {
        Some((key, value)) => with_attribute(application, key, value),
        None => application.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.testapp">
    <uses-permission android:name="android.permission.INTERNET"/>
    <application android:label="@string/app_name">
        <activity android:name=".MainActivity" android:exported="true">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
            </intent-filter>
        </activity>
    </application>
</manifest>
"#;

    #[test]
    fn reads_package() {
        assert_eq!(read_package(MANIFEST).unwrap(), "com.example.testapp");
        let err = read_package("<manifest><application/></manifest>").unwrap_err();
        assert!(matches!(err, PatcherError::MissingPackageAttribute));
    }

    #[test]
    fn adds_provider_as_last_child() {
        let patched = patch_manifest(MANIFEST).unwrap();
        let provider = r#"<provider android:name="com.guthyerrz.autoproxy.AutoProxyInitializer" android:authorities="com.example.testapp.autoproxy-init" android:exported="false"/>"#;
        assert!(patched.contains(provider), "{patched}");

        let provider_at = patched.find("<provider").unwrap();
        assert!(provider_at > patched.find("</activity>").unwrap());
        assert!(provider_at < patched.find("</application>").unwrap());
        assert!(patched.contains(&format!("\n        {provider}\n    </application>")));
        // Everything else is untouched
        assert!(patched.starts_with(&MANIFEST[..MANIFEST.find("</application>").unwrap() - 5]));
    }

    #[test]
    fn second_patch_reports_already_patched() {
        let patched = patch_manifest(MANIFEST).unwrap();
        let err = patch_manifest(&patched).unwrap_err();
        assert!(matches!(err, PatcherError::AlreadyPatched(_)));
        assert!(err.to_string().contains("already exists in manifest"));
    }

    #[test]
    fn uses_document_prefix() {
        let xml = r#"<manifest xmlns:a="http://schemas.android.com/apk/res/android" package="p.q"><application a:label="x"></application></manifest>"#;
        let patched = patch_manifest(xml).unwrap();
        assert!(patched.contains(r#"<provider a:name="com.guthyerrz.autoproxy.AutoProxyInitializer" a:authorities="p.q.autoproxy-init" a:exported="false"/>"#));
        assert!(!patched.contains("xmlns:android"));
        // Detection works through the custom prefix too
        assert!(matches!(patch_manifest(&patched), Err(PatcherError::AlreadyPatched(_))));
    }

    #[test]
    fn declares_namespace_when_unbound() {
        let xml = r#"<manifest package="p.q"><application/></manifest>"#;
        let patched = patch_manifest(xml).unwrap();
        assert!(patched.contains(r#"xmlns:android="http://schemas.android.com/apk/res/android""#));
        assert!(patched.contains("<application><provider android:name="));
        assert!(patched.ends_with("</application></manifest>"));
    }

    #[test]
    fn missing_application() {
        let xml = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="p.q"></manifest>"#;
        assert!(matches!(
            patch_manifest(xml),
            Err(PatcherError::MissingApplicationElement)
        ));
    }

    #[test]
    fn nsc_reference_is_added_once() {
        assert_eq!(network_security_config_ref(MANIFEST).unwrap(), None);
        let patched = ensure_nsc_reference(MANIFEST, "@xml/network_security_config").unwrap();
        assert!(patched.contains(
            r#"<application android:label="@string/app_name" android:networkSecurityConfig="@xml/network_security_config">"#
        ));
        assert_eq!(
            network_security_config_ref(&patched).unwrap().as_deref(),
            Some("@xml/network_security_config")
        );

        let again = ensure_nsc_reference(&patched, "@xml/other").unwrap();
        assert_eq!(again, patched);
    }

    #[test]
    fn missing_package_is_reported_first() {
        let xml = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android"><application><provider android:name="com.guthyerrz.autoproxy.AutoProxyInitializer"/></application></manifest>"#;
        assert!(matches!(
            patch_manifest(xml),
            Err(PatcherError::MissingPackageAttribute)
        ));

        let xml = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="p.q"><provider android:name="com.guthyerrz.autoproxy.AutoProxyInitializer"/></manifest>"#;
        assert!(matches!(patch_manifest(xml), Err(PatcherError::AlreadyPatched(_))));
    }

    #[test]
    fn blank_nsc_reference_is_replaced() {
        let xml = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="p.q"><application android:label="x" android:networkSecurityConfig=""/></manifest>"#;
        assert_eq!(network_security_config_ref(xml).unwrap(), None);

        let patched = ensure_nsc_reference(xml, "@xml/network_security_config").unwrap();
        assert_eq!(patched.matches("networkSecurityConfig").count(), 1);
        assert_eq!(
            network_security_config_ref(&patched).unwrap().as_deref(),
            Some("@xml/network_security_config")
        );
        assert!(patched.contains(r#"android:label="x""#));
    }

    #[test]
    fn malformed_manifest() {
        assert!(matches!(
            patch_manifest("<manifest package=\"a\"><application></manifest>"),
            Err(PatcherError::Xml { .. })
        ));
    }
}

//! Device identity and update settings on local disk

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use xmltree::{Element, EmitterConfig};

use crate::session::{
    platform_from_version, DeviceFamily, DeviceIdentity, DeviceProfile, UpdateConfig,
};

/// Where the agent reads its identity at startup and writes back the few
/// fields the protocol may change.
pub trait DeviceStore: Send + Sync {
    /// Load everything available. Missing or broken files are logged and
    /// replaced by defaults; only the caller decides what is fatal.
    fn load_profile(&self) -> DeviceProfile;
    fn save_update_config(&self, config: &UpdateConfig) -> Result<()>;
    fn save_device_id(&self, id: i64) -> Result<()>;
}

/// File-backed store.
///
/// * update config: JSON `{"Policy":"Auto","Open Time":0,"Close Time":24}`
/// * install info: `KEY=VALUE` lines (`VERSION`, `INSTALLATION_PATH`)
/// * identity: the device's `hardware.xml`
#[derive(Debug, Clone)]
pub struct FileStore {
    pub update_config: PathBuf,
    pub install_info: PathBuf,
    pub identity: PathBuf,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallInfo {
    pub version: String,
    pub installation_path: String,
}

pub fn parse_install_info(text: &str) -> InstallInfo {
    let mut info = InstallInfo::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "VERSION" => info.version = value.trim().to_string(),
            "INSTALLATION_PATH" => info.installation_path = value.trim().to_string(),
            _ => {}
        }
    }
    info
}

/// Identity elements under `<root>`, in lookup order. The first attribute of
/// whichever is present holds the device id.
const FAMILY_ELEMENTS: [(&str, DeviceFamily); 4] = [
    ("flight_ID", DeviceFamily::Flight),
    ("airport_ID", DeviceFamily::Airport),
    ("ugv_ID", DeviceFamily::Ugv),
    ("ground_station_info", DeviceFamily::GroundStation),
];

fn parse_root(text: &str) -> Result<Element> {
    let root = Element::parse(text.as_bytes()).map_err(|e| anyhow!("malformed XML: {}", e))?;
    if root.name != "root" {
        bail!("expected <root>, found <{}>", root.name);
    }
    Ok(root)
}

fn attr(root: &Element, child: &str, name: &str) -> String {
    root.get_child(child)
        .and_then(|c| c.attributes.get(name))
        .cloned()
        .unwrap_or_default()
}

/// Read id, family, model and serial from `hardware.xml` text.
///
/// A file without any identity element yields family `Unknown` and id 0;
/// a present but non-numeric id is an error.
pub fn parse_hardware_xml(text: &str) -> Result<DeviceIdentity> {
    let root = parse_root(text)?;
    let mut identity = DeviceIdentity {
        model: attr(&root, "varient_type", "type"),
        serial: attr(&root, "serial_num", "number"),
        ..DeviceIdentity::default()
    };
    let found = FAMILY_ELEMENTS
        .iter()
        .find_map(|(name, family)| root.get_child(*name).map(|el| (*name, *family, el)));
    match found {
        Some((name, family, el)) => {
            let raw = el
                .attributes
                .values()
                .next()
                .with_context(|| format!("<{}> has no id attribute", name))?;
            identity.id = raw
                .trim()
                .parse()
                .with_context(|| format!("<{}> id {:?} is not an integer", name, raw))?;
            identity.family = family;
        }
        None => error!("hardware.xml names no device family"),
    }
    Ok(identity)
}

/// Rewrite the id attribute in `hardware.xml` text, leaving everything else
/// in place.
pub fn set_hardware_id(text: &str, id: i64) -> Result<String> {
    let mut root = parse_root(text)?;
    let (name, _) = FAMILY_ELEMENTS
        .iter()
        .find(|(name, _)| root.get_child(*name).is_some())
        .context("hardware.xml names no device family")?;
    let el = root
        .get_mut_child(*name)
        .with_context(|| format!("<{}> disappeared", name))?;
    let value = el
        .attributes
        .values_mut()
        .next()
        .with_context(|| format!("<{}> has no id attribute", name))?;
    *value = id.to_string();

    let mut out = Vec::new();
    root.write_with_config(&mut out, EmitterConfig::new().perform_indent(true))
        .map_err(|e| anyhow!("serialize hardware.xml: {}", e))?;
    String::from_utf8(out).context("serialized hardware.xml is not UTF-8")
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    // write-then-rename so a power cut never leaves a half-written file
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

impl FileStore {
    pub fn read_update_config(&self) -> Result<UpdateConfig> {
        let text = fs::read_to_string(&self.update_config)
            .with_context(|| format!("read {}", self.update_config.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse {}", self.update_config.display()))
    }

    pub fn read_install_info(&self) -> Result<InstallInfo> {
        let text = fs::read_to_string(&self.install_info)
            .with_context(|| format!("read {}", self.install_info.display()))?;
        Ok(parse_install_info(&text))
    }

    pub fn read_identity(&self) -> Result<DeviceIdentity> {
        let text = fs::read_to_string(&self.identity)
            .with_context(|| format!("read {}", self.identity.display()))?;
        parse_hardware_xml(&text).with_context(|| format!("parse {}", self.identity.display()))
    }
}

impl DeviceStore for FileStore {
    fn load_profile(&self) -> DeviceProfile {
        let mut profile = DeviceProfile::default();

        match self.read_update_config() {
            Ok(cfg) => profile.update_config = cfg,
            Err(e) => error!(error = %format!("{:#}", e), "update config unavailable; using defaults"),
        }

        match self.read_install_info() {
            Ok(info) => {
                match platform_from_version(&info.version) {
                    Some(platform) => profile.identity.platform = platform.to_string(),
                    None => error!(version = %info.version, "software version has no platform prefix"),
                }
                profile.software_version = info.version;
                profile.installation_path = info.installation_path;
            }
            Err(e) => error!(error = %format!("{:#}", e), "install info unavailable"),
        }

        match self.read_identity() {
            Ok(identity) => {
                profile.identity = DeviceIdentity {
                    platform: profile.identity.platform,
                    ..identity
                }
            }
            Err(e) => warn!(error = %format!("{:#}", e), "device identity unavailable"),
        }

        info!(
            id = profile.identity.id,
            family = ?profile.identity.family,
            model = %profile.identity.model,
            serial = %profile.identity.serial,
            platform = %profile.identity.platform,
            version = %profile.software_version,
            installation_path = %profile.installation_path,
            policy = %profile.update_config.policy,
            "device profile loaded"
        );
        profile
    }

    fn save_update_config(&self, config: &UpdateConfig) -> Result<()> {
        let text = serde_json::to_string_pretty(config)?;
        write_file(&self.update_config, text.as_bytes())
    }

    fn save_device_id(&self, id: i64) -> Result<()> {
        // The identity file must already exist; an id alone is not an identity.
        let text = fs::read_to_string(&self.identity)
            .with_context(|| format!("read {}", self.identity.display()))?;
        let updated = set_hardware_id(&text, id)
            .with_context(|| format!("update {}", self.identity.display()))?;
        write_file(&self.identity, updated.as_bytes())
    }
}

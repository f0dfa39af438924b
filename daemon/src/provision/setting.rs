use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;
use lazy_static::lazy_static;
use regex::{NoExpand, Regex};

use dsfleet_protocol::utils::PlaceHolderRender;

use crate::error::FleetError;

lazy_static! {
    static ref GUID: Regex = Regex::new(r"<Guid>(.*?)</Guid>").expect("Failed to compile GUID regex");
    static ref INSTANCE_PATH: Regex = Regex::new(r"<InstancePath>.*?</InstancePath>")
        .expect("Failed to compile INSTANCE_PATH regex");
    static ref LOAD_WORLD: Regex =
        Regex::new(r"<LoadWorld>.*?</LoadWorld>").expect("Failed to compile LOAD_WORLD regex");
    static ref IP: Regex = Regex::new(r"<IP>.*?</IP>").expect("Failed to compile IP regex");
    static ref SERVER_PORT: Regex =
        Regex::new(r"<ServerPort>\d+</ServerPort>").expect("Failed to compile SERVER_PORT regex");
    static ref REMOTE_API_PORT: Regex = Regex::new(r"<RemoteApiPort>\d+</RemoteApiPort>")
        .expect("Failed to compile REMOTE_API_PORT regex");
    static ref SERVER_NAME: Regex =
        Regex::new(r"<ServerName>.*?</ServerName>").expect("Failed to compile SERVER_NAME regex");
}

const PLUGINS_PLACEHOLDER: &str = "<Plugins></Plugins>";
const MANIFEST: &str = "manifest.xml";

/// Rewrites a text file in place through `editor`.
fn edit<F>(path: &Path, editor: F) -> anyhow::Result<()>
where
    F: FnOnce(String) -> anyhow::Result<String>,
{
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let edited = editor(content)?;
    fs::write(path, edited).with_context(|| format!("failed to write {}", path.display()))
}

fn replace_required(
    text: &str,
    pattern: &Regex,
    replacement: &str,
    path: &Path,
) -> anyhow::Result<String> {
    if !pattern.is_match(text) {
        return Err(FleetError::validation(format!(
            "Pattern {} not found in {}",
            pattern.as_str(),
            path.display()
        ))
        .into());
    }
    Ok(pattern.replace_all(text, NoExpand(replacement)).into_owned())
}

/// First `<Guid>` of every extracted plugin's manifest, sorted.
pub fn plugin_guids(plugins_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut guids = Vec::new();
    let entries = fs::read_dir(plugins_dir)
        .with_context(|| format!("failed to list {}", plugins_dir.display()))?;
    for entry in entries {
        let manifest = entry?.path().join(MANIFEST);
        if !manifest.is_file() {
            continue;
        }
        let content = fs::read_to_string(&manifest)
            .with_context(|| format!("failed to read {}", manifest.display()))?;
        let guid = GUID
            .captures(&content)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                FleetError::validation(format!("No <Guid> found in {}", manifest.display()))
            })?;
        guids.push(guid);
    }
    guids.sort();
    Ok(guids)
}

/// Points `Torch.cfg` at the instance folder and enables the extracted plugins.
pub fn configure_torch(
    torch_cfg: &Path,
    plugins_dir: &Path,
    user_name: &str,
) -> anyhow::Result<()> {
    let instance_path = format!(
        "<InstancePath>C:\\Users\\{}\\My Documents\\Instance</InstancePath>",
        user_name
    );
    edit(torch_cfg, |text| {
        let text = INSTANCE_PATH
            .replace_all(&text, NoExpand(&instance_path))
            .into_owned();
        if !text.contains(PLUGINS_PLACEHOLDER) {
            return Err(FleetError::validation(format!(
                "Invalid Torch.cfg template: {}",
                torch_cfg.display()
            ))
            .into());
        }
        let guids = plugin_guids(plugins_dir)?
            .iter()
            .map(|g| format!("<guid>{}</guid>", g))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text.replacen(
            PLUGINS_PLACEHOLDER,
            &format!("<Plugins>\n{}\n</Plugins>", guids),
            1,
        ))
    })
}

/// Values written into the dedicated server config.
pub struct DedicatedSettings<'a> {
    pub user_name: &'a str,
    pub port: u16,
    pub admin_port: u16,
    pub server_name: &'a str,
}

pub fn configure_dedicated_server(cfg: &Path, settings: &DedicatedSettings) -> anyhow::Result<()> {
    edit(cfg, |text| {
        let load_world = format!(
            "<LoadWorld>C:/users/{}/My Documents/Instance/Saves/World</LoadWorld>",
            settings.user_name
        );
        let text = replace_required(&text, &LOAD_WORLD, &load_world, cfg)?;
        let text = replace_required(&text, &IP, "<IP>0.0.0.0</IP>", cfg)?;
        let text = replace_required(
            &text,
            &SERVER_PORT,
            &format!("<ServerPort>{}</ServerPort>", settings.port),
            cfg,
        )?;
        let text = replace_required(
            &text,
            &REMOTE_API_PORT,
            &format!("<RemoteApiPort>{}</RemoteApiPort>", settings.admin_port),
            cfg,
        )?;
        replace_required(
            &text,
            &SERVER_NAME,
            &format!("<ServerName>{}</ServerName>", settings.server_name),
            cfg,
        )
    })
}

/// Hosting plugin settings: deployment environment and the advertised address.
pub fn configure_plugin(path: &Path, environment: &str, ip: &str, port: u16) -> anyhow::Result<()> {
    let config = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<SpaceBattleConfig
  xmlns:xsd="http://www.w3.org/2001/XMLSchema"
  xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">

  <Environment>{}</Environment>
  <Address>{}:{}</Address>

</SpaceBattleConfig>"#,
        environment, ip, port
    );
    fs::write(path, config).with_context(|| format!("failed to write {}", path.display()))
}

pub fn write_start_script(
    path: &Path,
    template: &str,
    vars: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let script = template
        .format(vars)
        .map_err(|e| FleetError::Config(format!("start script template: {}", e)))?;
    fs::write(path, script).with_context(|| format!("failed to write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

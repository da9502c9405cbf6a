//! Daemon configuration file.
//!
//! ```toml
//! [backend]
//! mdns-name = "studio"
//!
//! [instances.desk]
//! mode = "apple"
//! invite = ["192.168.1.20:5004", "Stage Laptop"]
//! channels = ["ch0.note60"]
//! ```
//!
//! Every key except `channels` is handed to the backend as an option. Arrays
//! become repeated options.

use std::collections::BTreeMap;

use serde::Deserialize;

use rtpmidi_backend::Backend;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub backend: BTreeMap<String, OptionValue>,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceSection {
    /// Channel specs to register, e.g. `ch0.note60`
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl OptionValue {
    /// The option values to apply, one per backend call.
    pub fn values(&self) -> Vec<String> {
        match self {
            Self::Bool(b) => vec![b.to_string()],
            Self::Integer(n) => vec![n.to_string()],
            Self::Text(s) => vec![s.clone()],
            Self::List(items) => items.clone(),
        }
    }
}

pub fn parse(text: &str) -> Result<DaemonConfig, toml::de::Error> {
    toml::from_str(text)
}

/// Create and configure a backend from the file contents. All problems are
/// collected and reported together.
pub fn build_backend(config: &DaemonConfig) -> anyhow::Result<Backend> {
    let mut backend = Backend::new();
    let mut errors = Vec::new();

    for (option, value) in &config.backend {
        for value in value.values() {
            if let Err(e) = backend.configure(option, &value) {
                errors.push(format!("[backend] {}", e));
            }
        }
    }

    for (name, section) in &config.instances {
        let id = match backend.create_instance(name) {
            Ok(id) => id,
            Err(e) => {
                errors.push(format!("[instances.{}] {}", name, e));
                continue;
            }
        };

        // Mode-specific options are only accepted once the mode is known
        let ordered = section
            .options
            .get_key_value("mode")
            .into_iter()
            .chain(section.options.iter().filter(|(option, _)| *option != "mode"));
        for (option, value) in ordered {
            for value in value.values() {
                if let Err(e) = backend.configure_instance(id, option, &value) {
                    errors.push(format!("[instances.{}] {}", name, e));
                }
            }
        }

        for spec in &section.channels {
            if let Err(e) = backend.channel(id, spec) {
                errors.push(format!("[instances.{}] channel {:?}: {}", name, spec, e));
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtpmidi_backend::Mode;

    #[test]
    fn test_parse_sections_and_values() {
        let config = parse(
            r#"
            [backend]
            mdns-name = "studio"

            [instances.desk]
            mode = "apple"
            ssrc = 4660
            invite = ["10.0.0.2:5004", "Laptop"]
            channels = ["ch0.note60"]

            [instances.wall]
            mode = "direct"
            learn = true
            "#,
        )
        .unwrap();

        assert_eq!(config.backend["mdns-name"], OptionValue::Text("studio".into()));
        let desk = &config.instances["desk"];
        assert_eq!(desk.channels, vec!["ch0.note60".to_string()]);
        assert_eq!(desk.options["ssrc"].values(), vec!["4660".to_string()]);
        assert_eq!(desk.options["invite"].values().len(), 2);
        assert!(!desk.options.contains_key("channels"));
        assert_eq!(config.instances["wall"].options["learn"].values(), vec!["true".to_string()]);
    }

    #[test]
    fn test_mode_applied_before_other_options() {
        // `invite` sorts before `mode`
        let config = parse(
            r#"
            [instances.desk]
            invite = "10.0.0.2:5004"
            mode = "apple"
            "#,
        )
        .unwrap();

        let backend = build_backend(&config).unwrap();
        let id = backend.find_instance("desk").unwrap();
        let instance = backend.instance(id).unwrap();
        assert_eq!(instance.mode(), Mode::Apple);
        assert_eq!(
            instance.config().invite.endpoints,
            vec!["10.0.0.2:5004".parse().unwrap()]
        );
    }

    #[test]
    fn test_all_errors_reported() {
        let config = parse(
            r#"
            [backend]
            colour = "blue"

            [instances.a]
            mode = "direct"
            invite = "10.0.0.2"

            [instances.b]
            mode = "apple"
            channels = ["ch16.cc1"]
            "#,
        )
        .unwrap();

        let message = build_backend(&config).unwrap_err().to_string();
        assert!(message.contains("[backend]"));
        assert!(message.contains("[instances.a]"));
        assert!(message.contains("[instances.b] channel"));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = parse(include_str!("../../../config/rtpmidi.toml")).unwrap();
        let backend = build_backend(&config).unwrap();
        assert!(backend.find_instance("desk").is_some());
        assert!(backend.find_instance("wall").is_some());
    }
}

//! Built-in theme plugin used by the `demo` subcommand.

use std::collections::BTreeMap;

use musical_conductor_core::{
    Beat, BeatContext, BeatKind, BeatTiming, DemoConfig, HandlerError, HandlerRegistry, Movement,
    PluginBundle, PluginManifest, SequenceDef,
};
use serde_json::Value;

pub const PLUGIN_ID: &str = "theme";
pub const SEQUENCE_ID: &str = "theme-switch";

const SUPPORTED_THEMES: &[&str] = &["dark", "light", "high-contrast"];

pub fn bundle(config: &DemoConfig) -> PluginBundle {
    let sequence = SequenceDef::new(
        SEQUENCE_ID,
        "Theme Switch",
        vec![
            Movement::new(
                "apply",
                vec![
                    Beat::new(1, "theme:validate", "validateTheme"),
                    Beat::new(2, "theme:apply", "applyTheme").kind(BeatKind::StageCrew),
                    Beat::new(3, "theme:persist", "persistTheme")
                        .kind(BeatKind::Io)
                        .timing(BeatTiming::Delayed),
                    Beat::new(4, "theme:notify", "notifyThemeChange")
                        .timing(BeatTiming::Synchronized),
                ],
            ),
        ],
    );

    let mut topics = BTreeMap::new();
    topics.insert(config.topic.clone(), SEQUENCE_ID.to_string());
    let manifest = PluginManifest {
        id: PLUGIN_ID.to_string(),
        sequences: vec![sequence],
        topics,
    };

    let default_theme = config.default_theme.clone();
    let handlers = HandlerRegistry::new()
        .with_sync("validateTheme", move |baton, context| {
            let theme = baton
                .get_str("targetTheme")
                .unwrap_or(default_theme.as_str())
                .to_string();
            if !SUPPORTED_THEMES.contains(&theme.as_str()) {
                return Err(format!("unsupported theme `{theme}`").into());
            }
            context.logger().debug("theme accepted");
            baton.set("theme", theme);
            Ok(())
        })
        .with_sync("applyTheme", |baton, context| {
            let theme = baton.get_str("theme").unwrap_or_default();
            if let Some(ui) = context.ui() {
                ui.set_property("body", "data-theme", theme)?;
            }
            Ok(())
        })
        .with_async("persistTheme", |baton, context: BeatContext| async move {
            let theme = baton.get("theme")?.unwrap_or(Value::Null);
            if let Some(store) = context.store() {
                store.put("ui.theme", theme).await?;
                baton.set("persisted", true)?;
            }
            Ok::<(), HandlerError>(())
        })
        .with_sync("notifyThemeChange", |baton, context| {
            let persisted = baton.get("persisted").cloned().unwrap_or(Value::Bool(false));
            context.logger().info("theme changed");
            baton.set("notified", persisted);
            Ok(())
        });

    PluginBundle::new(manifest, handlers)
}

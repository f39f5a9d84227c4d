use crate::cli::AppOptions;
use anyhow::{anyhow, Context, Result};
use lidarstore_common::action::ActionRegistry;
use lidarstore_common::editor::events::EditorEvent;
use lidarstore_common::editor::settings::EditorSettings;
use lidarstore_common::editor::Editor;
use log::info;
use serde_json::json;

pub fn run(options: AppOptions) -> Result<()> {
    let editor = Editor::new(EditorSettings {
        cache_size_maximum: options.cache_size,
        ..Default::default()
    });
    let events = editor.subscribe();

    editor
        .open(&options.input)
        .with_context(|| format!("Failed to open {}", options.input.display()))?;

    let action = ActionRegistry::with_builtin().create("ground-classification")?;
    let name = action.name();
    editor.run_action(
        action,
        json!({
            "cell_points": options.cell_points,
            "ground_threshold": options.ground_threshold,
        }),
    )?;

    // wait for the action to finish
    let mut last_percent = None;
    loop {
        match events.recv()? {
            EditorEvent::ActionProgress { progress, .. } => {
                let percent = (progress * 100.0) as u32;
                if last_percent != Some(percent) {
                    info!("{name}: {percent}%");
                    last_percent = Some(percent);
                }
            }
            EditorEvent::ActionFinished { .. } => break,
            EditorEvent::ActionCancelled { .. } => return Err(anyhow!("{name} was cancelled")),
            EditorEvent::Error(message) => return Err(anyhow!(message)),
            _ => {}
        }
    }

    let nr_pages = editor.flush()?;
    info!("{name}: done ({nr_pages} more pages written)");
    Ok(())
}

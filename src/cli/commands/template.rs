//! Title-block template commands.

use std::path::PathBuf;

use console::style;

use crate::cli::helpers::{open_db, or_dash};
use crate::config::Settings;
use crate::models::{FieldMappings, Orientation, Rect, TitleBlockTemplate, MAPPED_FIELDS};
use crate::repository::TemplateInput;

/// Arguments of `template add`.
pub struct NewTemplate {
    pub project: i32,
    pub name: String,
    pub crop: Rect,
    pub orientation: Option<String>,
    pub size_bucket: Option<String>,
    pub anchors: Vec<String>,
    pub field_mappings: Option<PathBuf>,
}

/// Parse a field mappings file, keeping only known fields with usable regions.
fn parse_field_mappings(json: &str, crop: &Rect) -> anyhow::Result<FieldMappings> {
    let mut mappings: FieldMappings = serde_json::from_str(json)?;

    let unknown: Vec<String> = mappings
        .keys()
        .filter(|k| !MAPPED_FIELDS.contains(&k.as_str()))
        .cloned()
        .collect();
    for key in unknown {
        println!("  {} Ignoring unknown field '{}'", style("!").yellow(), key);
        mappings.remove(&key);
    }

    if let Some((field, _)) = mappings.iter().find(|(_, m)| m.page_rect(crop).is_none()) {
        anyhow::bail!("Field '{}' needs a boundingBox or x/y/w/h", field);
    }
    Ok(mappings)
}

pub async fn cmd_template_add(settings: &Settings, new: NewTemplate) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let field_mappings = match &new.field_mappings {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            Some(parse_field_mappings(&json, &new.crop)?).filter(|m| !m.is_empty())
        }
        None => None,
    };

    let anchors: Vec<String> = new
        .anchors
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();

    let input = TemplateInput {
        project_id: new.project,
        name: new.name,
        crop_rect: new.crop,
        orientation: new.orientation.as_deref().and_then(Orientation::from_str),
        size_bucket: new.size_bucket,
        anchor_labels: (!anchors.is_empty()).then_some(anchors),
        field_mappings,
    };

    let id = ctx.templates().create(&input).await?;
    println!(
        "{} Added template {} '{}' to project {}",
        style("✓").green(),
        id,
        input.name,
        input.project_id
    );
    Ok(())
}

pub async fn cmd_template_list(settings: &Settings, project_id: i32) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;
    let templates = ctx.templates().list_for_project(project_id).await?;

    if templates.is_empty() {
        println!("{} No templates for project {}", style("!").yellow(), project_id);
        return Ok(());
    }

    println!(
        "{:>5}  {:<24} {:<10} {:<11} {:<27} {:>5}  {}",
        "ID", "Name", "Orient.", "Size", "Crop (x,y,w,h)", "Uses", "Fields"
    );
    for t in &templates {
        let crop = format!(
            "{:.3},{:.3},{:.3},{:.3}",
            t.crop_rect.x, t.crop_rect.y, t.crop_rect.w, t.crop_rect.h
        );
        let fields = t
            .mappings()
            .map(|m| m.keys().cloned().collect::<Vec<_>>().join(","));
        println!(
            "{:>5}  {:<24} {:<10} {:<11} {:<27} {:>5}  {}",
            t.id,
            t.name,
            or_dash(t.orientation.map(|o| o.as_str())),
            or_dash(t.size_bucket.as_deref()),
            crop,
            t.success_count,
            or_dash(fields.as_deref()),
        );
    }
    Ok(())
}

/// Score the project's templates against a sheet the way extraction does.
pub async fn cmd_template_match(settings: &Settings, sheet_id: i32) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let Some(sheet) = ctx.sheets().get(sheet_id).await? else {
        println!("{} Sheet {} not found", style("✗").red(), sheet_id);
        return Ok(());
    };
    let templates = ctx.templates().list_for_project(sheet.project_id).await?;

    println!(
        "Sheet {} ({}, {})",
        sheet.id,
        or_dash(sheet.page_orientation.map(|o| o.as_str())),
        or_dash(sheet.size_bucket.as_deref())
    );

    let matches = TitleBlockTemplate::find_best_matches(
        &templates,
        sheet.page_orientation,
        sheet.size_bucket.as_deref(),
        templates.len(),
    );
    if matches.is_empty() {
        println!("{} No matching templates", style("!").yellow());
        return Ok(());
    }

    for (rank, (score, t)) in matches.iter().enumerate() {
        let marker = if rank < 2 {
            style("*").green().to_string()
        } else {
            " ".to_string()
        };
        println!("  {} {:>4}  {} ({})", marker, score, t.name, t.id);
    }
    println!("  {} tried automatically", style("*").green());
    Ok(())
}

pub async fn cmd_template_delete(settings: &Settings, id: i32) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;
    if ctx.templates().delete(id).await? {
        println!("{} Deleted template {}", style("✓").green(), id);
    } else {
        println!("{} Template {} not found", style("✗").red(), id);
    }
    Ok(())
}

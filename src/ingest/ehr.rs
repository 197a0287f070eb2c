//! EHR export conversion: a directory of `.tsv` tables rendered as Markdown.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{rtf, ImportBoundary, ImportPath, IngestError};

pub const EHI_TABLES_DIR: &str = "EHITables";
pub const EHI_RICH_TEXT_DIR: &str = "Rich Text";
pub const EHI_MEDIA_DIR: &str = "Media";

const TABLES_OUTPUT_DIR: &str = "EHITables_Markdown";
const RICH_TEXT_OUTPUT_DIR: &str = "RichText_Text";
const MEDIA_OUTPUT_DIR: &str = "Media_Text";
const MEDIA_INDEX_FILE: &str = "media_index.md";

#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub columns: Option<Vec<ColumnSchema>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(default, rename = "type")]
    pub column_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub type SchemaMap = HashMap<String, TableSchema>;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub files: usize,
    pub converted: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportLayout {
    /// `.tsv` tables directly inside the input directory.
    #[default]
    Tables,
    /// `EHITables/`, `Rich Text/` and `Media/` sections.
    EhiExport,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub layout: ExportLayout,
    pub tables: ConversionReport,
    pub rich_text: ConversionReport,
    pub media_files: usize,
}

pub fn load_schema(path: &ImportPath) -> Result<SchemaMap, IngestError> {
    let text = path.read_to_string()?;
    serde_json::from_str(&text)
        .map_err(|e| IngestError::Validation(format!("invalid schema JSON: {e}")))
}

/// UTF-8 first, then Latin-1, which accepts any byte sequence.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|")
}

/// Splits TSV text into records. Double-quoted cells may hold tabs, doubled
/// quotes and line breaks. Blank lines are skipped.
fn read_records(content: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' if in_quotes => in_quotes = false,
            '"' if current.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            '\t' if !in_quotes => {
                record.push(std::mem::take(&mut current));
                quoted = false;
            }
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut current));
                quoted = false;
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !record.is_empty() {
        record.push(current);
        records.push(record);
    }
    records
}

/// One Markdown table cell: line breaks become `<br>` and pipes are escaped.
fn render_cell(cell: &str) -> String {
    let lines: Vec<&str> = cell.trim().lines().map(str::trim_end).collect();
    escape_cell(&lines.join("<br>"))
}

fn table_name(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

/// Renders one TSV table. `None` when there is nothing to render.
pub fn tsv_to_markdown(content: &str, filename: &str, schema: Option<&SchemaMap>) -> Option<String> {
    if content.trim().is_empty() {
        tracing::warn!(filename, "Skipping empty TSV file");
        return None;
    }

    let mut records = read_records(content).into_iter();

    let header = records.next()?;
    let rows: Vec<Vec<String>> = records.collect();
    if rows.is_empty() {
        tracing::warn!(filename, "TSV file has a header but no data rows");
        return Some(format!(
            "# {filename}\n\n_(Header only, no data rows found in TSV)_"
        ));
    }

    let table = table_name(filename);
    let table_schema = schema.and_then(|s| s.get(table));
    let width = header.len();

    let mut out = format!("# {filename} (`{table}`)\n\n");

    if let Some(info) = table_schema {
        let description = info.description.as_deref().unwrap_or("N/A");
        out.push_str(&format!(
            "## Table Description\n\n{}\n\n",
            collapse_whitespace(description)
        ));
        if !info.primary_key.is_empty() {
            out.push_str(&format!(
                "**Primary Key(s):** `{}`\n\n",
                info.primary_key.join(", ")
            ));
        }
    }

    out.push_str("## Data\n\n");
    out.push_str(&format!("| {} |\n", header.join(" | ")));
    out.push_str(&format!("|--{}|\n", vec!["-"; width].join("|--")));

    for mut row in rows {
        if row.len() > width {
            tracing::warn!(filename, columns = row.len(), width, "Truncating over-long TSV row");
        }
        row.resize(width, String::new());
        let cells: Vec<String> = row.iter().map(|c| render_cell(c)).collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    if let Some(columns) = table_schema.and_then(|info| info.columns.as_ref()) {
        out.push_str("\n## Column Definitions\n\n");
        out.push_str("| Column Name | Type | Description |\n");
        out.push_str("|---|---|---|\n");

        for name in &header {
            match columns.iter().find(|c| &c.name == name) {
                Some(column) => {
                    let column_type = column.column_type.as_deref().unwrap_or("N/A");
                    let description =
                        escape_cell(&collapse_whitespace(column.description.as_deref().unwrap_or("N/A")));
                    out.push_str(&format!("| `{name}` | `{column_type}` | {description} |\n"));
                }
                None => {
                    out.push_str(&format!("| `{name}` | N/A | _No schema definition found_ |\n"));
                }
            }
        }
    }

    Some(out)
}

/// Where output goes when the request names none: `<input>_Markdown` next to
/// the input, or inside the root when the input is the root itself.
pub fn default_output_dir(
    boundary: &ImportBoundary,
    input_dir: &ImportPath,
) -> Result<ImportPath, IngestError> {
    let name = input_dir
        .strictpath_file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ehr".to_string());
    let target = format!("{name}_Markdown");
    if input_dir.interop_path() == boundary.interop_path() {
        Ok(boundary.strict_join(target)?)
    } else {
        Ok(input_dir.strictpath_with_file_name(target)?)
    }
}

/// Regular files directly inside `dir` with the given extension, in name
/// order. Entries that resolve outside the root are skipped.
fn files_with_extension(dir: &ImportPath, extension: &str) -> Result<Vec<ImportPath>, IngestError> {
    let mut files = Vec::new();
    for entry in dir.read_dir()? {
        let entry = entry?;
        let path = match dir.strict_join(entry.file_name()) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping entry that leaves the import root");
                continue;
            }
        };
        let matches = path
            .strictpath_extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &ImportPath) -> String {
    path.strictpath_file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Converts every file with `extension` directly inside `input_dir`, writing
/// `<stem>.<out_extension>` into `output_dir`. `convert` returns `None` to
/// skip a file. Per-file failures are counted, not fatal.
fn convert_files<F>(
    input_dir: &ImportPath,
    output_dir: &ImportPath,
    extension: &str,
    out_extension: &str,
    convert: F,
) -> Result<ConversionReport, IngestError>
where
    F: Fn(&str, &[u8]) -> Option<String>,
{
    output_dir.create_dir_all()?;
    let mut report = ConversionReport::default();

    for path in files_with_extension(input_dir, extension)? {
        report.files += 1;
        let filename = file_name(&path);

        let bytes = match path.read() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(filename = %filename, error = %e, "Failed to read export file");
                report.errors += 1;
                continue;
            }
        };

        let Some(converted) = convert(&filename, &bytes) else {
            report.skipped += 1;
            continue;
        };

        let written = output_dir
            .strict_join(format!("{}.{out_extension}", table_name(&filename)))
            .map_err(IngestError::from)
            .and_then(|target| Ok(target.write(converted)?));
        match written {
            Ok(()) => report.converted += 1,
            Err(e) => {
                tracing::error!(filename = %filename, error = %e, "Failed to write converted file");
                report.errors += 1;
            }
        }
    }
    Ok(report)
}

/// Converts every `.tsv` file directly inside `input_dir` to Markdown.
pub fn convert_directory(
    input_dir: &ImportPath,
    output_dir: &ImportPath,
    schema: Option<&SchemaMap>,
) -> Result<ConversionReport, IngestError> {
    let report = convert_files(input_dir, output_dir, "tsv", "md", |filename, bytes| {
        tsv_to_markdown(&decode_text(bytes), filename, schema)
    })?;
    tracing::info!(
        input = %input_dir.strictpath_display(),
        output = %output_dir.strictpath_display(),
        tsv_files = report.files,
        converted = report.converted,
        skipped = report.skipped,
        errors = report.errors,
        "EHR table conversion complete"
    );
    Ok(report)
}

/// Converts every `.rtf` note directly inside `input_dir` to `.txt`.
pub fn convert_rich_text(
    input_dir: &ImportPath,
    output_dir: &ImportPath,
) -> Result<ConversionReport, IngestError> {
    let report = convert_files(input_dir, output_dir, "rtf", "txt", |filename, bytes| {
        let text = rtf::rtf_to_text(&decode_text(bytes));
        if text.is_empty() {
            tracing::warn!(filename, "RTF conversion produced no text");
            return None;
        }
        Some(text)
    })?;
    tracing::info!(
        input = %input_dir.strictpath_display(),
        rtf_files = report.files,
        converted = report.converted,
        skipped = report.skipped,
        errors = report.errors,
        "Rich text conversion complete"
    );
    Ok(report)
}

/// Writes a Markdown index of the media files; their content is not parsed.
fn index_media(input_dir: &ImportPath, output_dir: &ImportPath) -> Result<usize, IngestError> {
    output_dir.create_dir_all()?;
    let mut entries = Vec::new();
    for entry in input_dir.read_dir()? {
        let entry = entry?;
        let Ok(path) = input_dir.strict_join(entry.file_name()) else {
            continue;
        };
        if path.is_file() {
            entries.push(path);
        }
    }
    entries.sort();

    let mut index = String::from("# Media\n\n| File | Type | Size (bytes) |\n|---|---|---|\n");
    for path in &entries {
        let name = file_name(path);
        let kind = path
            .strictpath_extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        index.push_str(&format!("| {} | {kind} | {size} |\n", escape_cell(&name)));
    }
    output_dir.strict_join(MEDIA_INDEX_FILE)?.write(index)?;
    Ok(entries.len())
}

/// Whether `input_dir` looks like an EHI export rather than a bare table
/// directory.
pub fn detect_layout(input_dir: &ImportPath) -> ExportLayout {
    let has_dir = |name: &str| input_dir.strict_join(name).is_ok_and(|p| p.is_dir());
    if [EHI_TABLES_DIR, EHI_RICH_TEXT_DIR, EHI_MEDIA_DIR]
        .into_iter()
        .any(has_dir)
    {
        ExportLayout::EhiExport
    } else {
        ExportLayout::Tables
    }
}

/// Converts an export directory. An EHI export has its tables, rich-text
/// notes and media handled in separate output subdirectories; a missing
/// section is logged and skipped. Anything else is treated as a directory
/// of tables.
pub fn convert_export(
    input_dir: &ImportPath,
    output_dir: &ImportPath,
    schema: Option<&SchemaMap>,
) -> Result<ExportReport, IngestError> {
    let layout = detect_layout(input_dir);
    let mut report = ExportReport {
        layout,
        ..ExportReport::default()
    };

    if layout == ExportLayout::Tables {
        report.tables = convert_directory(input_dir, output_dir, schema)?;
        return Ok(report);
    }

    output_dir.create_dir_all()?;
    let section = |name: &str| -> Result<Option<ImportPath>, IngestError> {
        let dir = input_dir.strict_join(name)?;
        if dir.is_dir() {
            Ok(Some(dir))
        } else {
            tracing::warn!(section = name, "EHI export section not found");
            Ok(None)
        }
    };

    if let Some(tables) = section(EHI_TABLES_DIR)? {
        report.tables = convert_directory(&tables, &output_dir.strict_join(TABLES_OUTPUT_DIR)?, schema)?;
    }
    if let Some(notes) = section(EHI_RICH_TEXT_DIR)? {
        report.rich_text = convert_rich_text(&notes, &output_dir.strict_join(RICH_TEXT_OUTPUT_DIR)?)?;
    }
    if let Some(media) = section(EHI_MEDIA_DIR)? {
        report.media_files = index_media(&media, &output_dir.strict_join(MEDIA_OUTPUT_DIR)?)?;
    }

    tracing::info!(
        input = %input_dir.strictpath_display(),
        output = %output_dir.strictpath_display(),
        tables = report.tables.converted,
        notes = report.rich_text.converted,
        media_files = report.media_files,
        "EHI export conversion complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::import_boundary;

    fn schema() -> SchemaMap {
        serde_json::from_str(
            r#"{
                "PAT_ENC": {
                    "description": "One row per\n   patient encounter.",
                    "primary_key": ["PAT_ENC_CSN_ID"],
                    "columns": [
                        {"name": "PAT_ENC_CSN_ID", "type": "NUMERIC", "description": "Encounter | id"}
                    ]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn renders_table_with_separator_and_escapes() {
        let md = tsv_to_markdown("A\tB\nx|y\t 2 \n", "labs.tsv", None).unwrap();
        assert!(md.starts_with("# labs.tsv (`labs`)\n\n## Data\n\n"));
        assert!(md.contains("| A | B |\n|---|---|\n"));
        assert!(md.contains("| x\\|y | 2 |\n"));
    }

    #[test]
    fn pads_and_truncates_rows() {
        let md = tsv_to_markdown("A\tB\tC\n1\n1\t2\t3\t4\n", "t.tsv", None).unwrap();
        assert!(md.contains("| 1 |  |  |\n"));
        assert!(md.contains("| 1 | 2 | 3 |\n"));
        assert!(!md.contains("4"));
    }

    #[test]
    fn header_only_gets_a_note() {
        let md = tsv_to_markdown("A\tB\n", "empty.tsv", None).unwrap();
        assert_eq!(md, "# empty.tsv\n\n_(Header only, no data rows found in TSV)_");
        assert!(tsv_to_markdown("  \n", "blank.tsv", None).is_none());
    }

    #[test]
    fn schema_adds_description_key_and_columns() {
        let schema = schema();
        let md = tsv_to_markdown("PAT_ENC_CSN_ID\tEXTRA\n1\t2\n", "PAT_ENC.tsv", Some(&schema)).unwrap();
        assert!(md.contains("## Table Description\n\nOne row per patient encounter.\n\n"));
        assert!(md.contains("**Primary Key(s):** `PAT_ENC_CSN_ID`"));
        assert!(md.contains("| `PAT_ENC_CSN_ID` | `NUMERIC` | Encounter \\| id |"));
        assert!(md.contains("| `EXTRA` | N/A | _No schema definition found_ |"));
    }

    #[test]
    fn quoted_cells_keep_tabs() {
        assert_eq!(
            read_records("\"a\tb\"\tc\t\"say \"\"hi\"\"\""),
            vec![vec!["a\tb", "c", "say \"hi\""]]
        );
    }

    #[test]
    fn quoted_cells_span_lines() {
        assert_eq!(
            read_records("ID\tNOTE\r\n1\t\"line one\r\nline two\"\r\n\r\n2\tshort"),
            vec![
                vec!["ID", "NOTE"],
                vec!["1", "line one\r\nline two"],
                vec!["2", "short"],
            ]
        );

        let md = tsv_to_markdown("ID\tNOTE\n1\t\"line one\nline two\"\n", "notes.tsv", None).unwrap();
        let rows: Vec<&str> = md.lines().filter(|l| l.starts_with("| 1")).collect();
        assert_eq!(rows, vec!["| 1 | line one<br>line two |"]);
        assert!(!md.contains("line two\""));
    }

    #[test]
    fn latin1_fallback() {
        assert_eq!(decode_text(b"caf\xe9"), "café");
        assert_eq!(decode_text("café".as_bytes()), "café");
    }

    fn temp_boundary(tag: &str) -> (std::path::PathBuf, ImportBoundary) {
        let root = std::env::temp_dir().join(format!("medivault-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let boundary = import_boundary(&root).unwrap();
        (root, boundary)
    }

    #[test]
    fn default_output_stays_inside_the_root() {
        let (root, boundary) = temp_boundary("default-out");
        std::fs::create_dir_all(root.join("exports/ehi")).unwrap();
        let canonical = root.canonicalize().unwrap();

        let nested = boundary.strict_join("exports/ehi").unwrap();
        let output = default_output_dir(&boundary, &nested).unwrap();
        assert_eq!(output, canonical.join("exports/ehi_Markdown"));

        let whole_root = boundary.clone().into_strictpath().unwrap();
        let output = default_output_dir(&boundary, &whole_root).unwrap();
        let name = canonical.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(output, canonical.join(format!("{name}_Markdown")));
    }

    #[test]
    fn converts_a_directory() {
        let (root, boundary) = temp_boundary("ehr");
        let input = root.join("in");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("a.tsv"), "X\tY\n1\t2\n").unwrap();
        std::fs::write(input.join("b.TSV"), "X\n").unwrap();
        std::fs::write(input.join("c.tsv"), "").unwrap();
        std::fs::write(input.join("notes.txt"), "ignored").unwrap();

        let input = boundary.strict_join("in").unwrap();
        let output = boundary.strict_join("out").unwrap();
        let report = convert_directory(&input, &output, None).unwrap();
        assert_eq!(
            report,
            ConversionReport { files: 3, converted: 2, skipped: 1, errors: 0 }
        );
        assert!(root.join("out/a.md").exists());
        assert!(root.join("out/b.md").exists());
        assert!(!root.join("out/c.md").exists());
        assert_eq!(detect_layout(&input), ExportLayout::Tables);
    }

    #[test]
    fn converts_an_ehi_export() {
        let (root, boundary) = temp_boundary("ehi");
        let export = root.join("Requested Record");
        std::fs::create_dir_all(export.join("EHITables")).unwrap();
        std::fs::create_dir_all(export.join("Rich Text")).unwrap();
        std::fs::create_dir_all(export.join("Media")).unwrap();
        std::fs::write(export.join("EHITables/PAT_ENC.tsv"), "ID\n1\n").unwrap();
        std::fs::write(
            export.join("Rich Text/visit.RTF"),
            r"{\rtf1\ansi{\fonttbl{\f0 Arial;}}\f0 Stable on current dose.\par}",
        )
        .unwrap();
        std::fs::write(export.join("Rich Text/blank.rtf"), r"{\rtf1{\fonttbl{\f0 Arial;}}}").unwrap();
        std::fs::write(export.join("Media/scan.pdf"), b"%PDF-1.7").unwrap();

        let input = boundary.strict_join("Requested Record").unwrap();
        let output = default_output_dir(&boundary, &input).unwrap();
        let report = convert_export(&input, &output, None).unwrap();

        assert_eq!(report.layout, ExportLayout::EhiExport);
        assert_eq!(report.tables, ConversionReport { files: 1, converted: 1, skipped: 0, errors: 0 });
        assert_eq!(report.rich_text, ConversionReport { files: 2, converted: 1, skipped: 1, errors: 0 });
        assert_eq!(report.media_files, 1);

        let out = root.join("Requested Record_Markdown");
        assert!(out.join("EHITables_Markdown/PAT_ENC.md").exists());
        assert_eq!(
            std::fs::read_to_string(out.join("RichText_Text/visit.txt")).unwrap(),
            "Stable on current dose."
        );
        let index = std::fs::read_to_string(out.join("Media_Text/media_index.md")).unwrap();
        assert!(index.contains("| scan.pdf | pdf | 8 |"));
    }
}

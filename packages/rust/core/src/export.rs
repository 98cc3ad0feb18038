//! Flat result table for download.

use std::collections::BTreeMap;

use serde::Serialize;

use crawlbatch_shared::ResultRecord;

/// Text placed in the `Case` column when a row's group has no records.
pub const NO_RESULT: &str = "No Result";

/// Column headers, in output order.
pub const EXPORT_HEADER: [&str; 8] = [
    "#", "Keyword", "BlogID", "Case", "Section", "Theme", "Position", "Title",
];

/// One line of the exported table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportRow {
    /// 1-based index of the input data row (header excluded).
    #[serde(rename = "#")]
    pub index: usize,
    #[serde(rename = "Keyword")]
    pub keyword: String,
    #[serde(rename = "BlogID")]
    pub blog_id: String,
    #[serde(rename = "Case")]
    pub case: String,
    #[serde(rename = "Section")]
    pub section: String,
    #[serde(rename = "Theme")]
    pub theme: String,
    #[serde(rename = "Position")]
    pub position: String,
    #[serde(rename = "Title")]
    pub title: String,
}

/// Expand each input data row into the records of its group.
///
/// Every data row of the imported table is kept, so a group with several
/// members repeats its records once per member row. Rows whose group has no
/// records (failed, empty, or never run) get a single placeholder line.
pub fn export_rows(
    rows: &[Vec<String>],
    accumulated: &BTreeMap<String, Vec<ResultRecord>>,
) -> Vec<ExportRow> {
    let mut out = Vec::new();

    for (i, row) in rows.iter().skip(1).enumerate() {
        let keyword = row.first().cloned().unwrap_or_default();
        let blog_id = row.get(1).cloned().unwrap_or_default();
        let index = i + 1;

        match accumulated.get(&keyword).filter(|records| !records.is_empty()) {
            Some(records) => out.extend(records.iter().map(|r| ExportRow {
                index,
                keyword: keyword.clone(),
                blog_id: blog_id.clone(),
                case: r.case.clone(),
                section: r.section.clone(),
                theme: r.theme.clone(),
                position: r.position.clone(),
                title: r.title.clone(),
            })),
            None => out.push(ExportRow {
                index,
                keyword,
                blog_id,
                case: NO_RESULT.to_string(),
                ..ExportRow::default()
            }),
        }
    }

    out
}

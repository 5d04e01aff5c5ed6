use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use std::path::Path;

use crate::devops::WorkItem;

pub const REPORT_TITLE: &str = "Azure DevOps Work Item Report";

/// Column order of the rendered report.  Rows parsed back out of the HTML
/// are positional, so this order is part of the report format.
pub const REPORT_COLUMNS: [&str; 7] = [
    "Id",
    "Title",
    "State",
    "Assigned To",
    "Created Date",
    "Changed Date",
    "Tags",
];

const UNASSIGNED: &str = "Unassigned";
const EMPTY_CELL: &str = "-";

/// Header cells plus data rows extracted from an HTML table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// `M/D/YYYY, h:mm:ss AM` in UTC.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%-m/%-d/%Y, %-I:%M:%S %p").to_string()
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn push_row(html: &mut String, tag: &str, cells: &[String]) {
    html.push_str("<tr>");
    for cell in cells {
        html.push_str(&format!("<{tag}>{}</{tag}>", escape_html(cell)));
    }
    html.push_str("</tr>\n");
}

/// Render `items` as a standalone HTML document holding a single table.
pub fn render_html(items: &[WorkItem]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n",
    );
    html.push_str(&format!("<title>{REPORT_TITLE}</title>\n"));
    html.push_str(
        "<style>\ntable { border-collapse: collapse; font-family: sans-serif; }\n\
         th, td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; }\n\
         th { background: #f3f3f3; }\n</style>\n",
    );
    html.push_str("</head>\n<body>\n");
    html.push_str(&format!("<h1>{REPORT_TITLE}</h1>\n<table>\n"));

    let headers: Vec<String> = REPORT_COLUMNS.iter().map(|c| c.to_string()).collect();
    push_row(&mut html, "th", &headers);

    for item in items {
        let cells = [
            item.id.to_string(),
            item.title.clone(),
            item.state.clone(),
            item.assigned_to
                .clone()
                .unwrap_or_else(|| UNASSIGNED.to_string()),
            format_timestamp(&item.created_date),
            format_timestamp(&item.changed_date),
            item.tags.clone(),
        ];
        push_row(&mut html, "td", &cells);
    }

    html.push_str("</table>\n</body>\n</html>\n");
    html
}

pub async fn write_report(path: &Path, html: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, html)
        .await
        .with_context(|| format!("Failed to write report {}", path.display()))
}

pub async fn read_report(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read report {}", path.display()))
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector {css:?}: {e:?}"))
}

fn cell_texts(row: ElementRef<'_>, cells: &Selector) -> Vec<String> {
    row.select(cells)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

/// Parse the first `<table>` in `html`.
///
/// The first row supplies the headers (`th`, or `td` when the table has no
/// header cells); every later row with at least one `td` becomes a data row.
pub fn parse_html_table(html: &str) -> Result<ReportTable> {
    let document = Html::parse_document(html);
    let table = document
        .select(&selector("table")?)
        .next()
        .context("No <table> found in report")?;

    let th = selector("th")?;
    let td = selector("td")?;
    let tr = selector("tr")?;
    let mut rows = table.select(&tr);

    let header_row = rows.next().context("Report table has no rows")?;
    let mut headers = cell_texts(header_row, &th);
    if headers.is_empty() {
        headers = cell_texts(header_row, &td);
    }

    let rows = rows
        .map(|row| cell_texts(row, &td))
        .filter(|cells| !cells.is_empty())
        .collect();

    Ok(ReportTable { headers, rows })
}

fn column_set(cells: &[String], bold: bool) -> Value {
    let columns: Vec<Value> = cells
        .iter()
        .map(|cell| {
            let text = if cell.is_empty() { EMPTY_CELL } else { cell.as_str() };
            let mut block = json!({
                "type": "TextBlock",
                "text": text,
                "wrap": true,
            });
            if bold {
                block["weight"] = json!("Bolder");
            }
            json!({
                "type": "Column",
                "width": "stretch",
                "items": [block],
            })
        })
        .collect();

    json!({
        "type": "ColumnSet",
        "columns": columns,
    })
}

/// Build an Adaptive Card with a title, a generation timestamp and one
/// column set per table row, header row first.
pub fn to_adaptive_card(table: &ReportTable, generated_at: DateTime<Utc>) -> Value {
    let mut body = vec![
        json!({
            "type": "TextBlock",
            "text": REPORT_TITLE,
            "weight": "Bolder",
            "size": "Large",
            "wrap": true,
        }),
        json!({
            "type": "TextBlock",
            "text": format!("Generated on {}", format_timestamp(&generated_at)),
            "isSubtle": true,
            "spacing": "None",
            "wrap": true,
        }),
        column_set(&table.headers, true),
    ];
    body.extend(table.rows.iter().map(|row| column_set(row, false)));

    json!({
        "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
        "type": "AdaptiveCard",
        "version": "1.4",
        "body": body,
        "msteams": { "width": "Full" },
    })
}

//! Notification titles and bodies.

use shipwright_core::{Job, JobLog, NotificationType};

const ANSI_CLASSES: [(&str, &str); 16] = [
    ("\x1b[0;30m", "ansi-black"),
    ("\x1b[1;30m", "ansi-bright-black"),
    ("\x1b[0;31m", "ansi-red"),
    ("\x1b[1;31m", "ansi-bright-red"),
    ("\x1b[0;32m", "ansi-green"),
    ("\x1b[1;32m", "ansi-bright-green"),
    ("\x1b[0;33m", "ansi-yellow"),
    ("\x1b[1;33m", "ansi-bright-yellow"),
    ("\x1b[0;34m", "ansi-blue"),
    ("\x1b[1;34m", "ansi-bright-blue"),
    ("\x1b[0;35m", "ansi-magenta"),
    ("\x1b[1;35m", "ansi-bright-magenta"),
    ("\x1b[0;36m", "ansi-cyan"),
    ("\x1b[1;36m", "ansi-bright-cyan"),
    ("\x1b[0;37m", "ansi-white"),
    ("\x1b[1;37m", "ansi-bright-white"),
];

const ANSI_RESET: &str = "\x1b[0m";

const STYLE: &str = "body{font-family:sans-serif}\
table{border-collapse:collapse;margin-bottom:1em}\
th{text-align:left;padding-right:1em}\
.success{color:#2e7d32}.fail{color:#c62828}\
.logs{font-family:monospace;background:#1e1e1e;color:#ddd;padding:1em}\
.ansi-black{color:#000}.ansi-bright-black{color:#777}\
.ansi-red{color:#c00}.ansi-bright-red{color:#f55}\
.ansi-green{color:#0a0}.ansi-bright-green{color:#5f5}\
.ansi-yellow{color:#aa0}.ansi-bright-yellow{color:#ff5}\
.ansi-blue{color:#00c}.ansi-bright-blue{color:#55f}\
.ansi-magenta{color:#a0a}.ansi-bright-magenta{color:#f5f}\
.ansi-cyan{color:#0aa}.ansi-bright-cyan{color:#5ff}\
.ansi-white{color:#aaa}.ansi-bright-white{color:#fff}";

/// Notification title
#[must_use]
pub fn title(job: &Job, kind: NotificationType) -> String {
    format!("Shipwright job #{} {kind}", job.id)
}

/// Plain-text summary sent to webhooks
#[must_use]
pub fn text(job: &Job, kind: NotificationType) -> String {
    let (job_type, application, inventory) = summary(job);
    format!(
        "status: {kind}\nId: {}\ntype: {job_type}\napplication: {application}\ninventory: {inventory}\nversion: {}",
        job.id, job.version
    )
}

/// HTML summary with the job log, sent by email
#[must_use]
pub fn html(job: &Job, kind: NotificationType, logs: &[JobLog]) -> String {
    let title = escape(&title(job, kind));
    let (job_type, application, inventory) = summary(job);
    let user = job.user.as_ref().map_or("", |u| u.name.as_str());
    let started = job
        .started_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default();

    let rows = [
        ("Status", kind.to_string()),
        ("Job", format!("#{}", job.id)),
        ("Type", job_type.to_string()),
        ("Application", application.to_string()),
        ("Inventory", inventory.to_string()),
        ("Version", job.version.clone()),
        ("User", user.to_string()),
        ("Started", started),
    ];
    let table: String = rows
        .iter()
        .map(|(name, value)| format!("<tr><th>{name}</th><td>{}</td></tr>", escape(value)))
        .collect();
    let lines: Vec<String> = logs.iter().map(|l| ansi_to_html(&l.message)).collect();

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>{STYLE}</style></head><body>\
         <h1 class=\"{kind}\">{title}</h1><table>{table}</table>\
         <div class=\"logs\">{}</div></body></html>",
        lines.join("<br/>")
    )
}

/// Converts a log line to HTML
///
/// Colour escapes become `<span>` elements, newlines become `<br/>` and tabs
/// four non-breaking spaces. Markup in the line itself is escaped.
#[must_use]
pub fn ansi_to_html(line: &str) -> String {
    let mut html = escape(line);
    for (code, class) in ANSI_CLASSES {
        html = html.replace(code, &format!("<span class=\"{class}\">"));
    }
    html.replace(ANSI_RESET, "</span>")
        .replace('\n', "<br/>")
        .replace('\t', "&nbsp&nbsp&nbsp&nbsp")
}

fn summary(job: &Job) -> (&str, &str, &str) {
    (
        job.job_type.map_or("", |t| t.as_str()),
        job.application.as_ref().map_or("", |a| a.name.as_str()),
        job.inventory.as_ref().map_or("", |i| i.name.as_str()),
    )
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

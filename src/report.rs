//! HTML and plain-text rendering of report pages.

use crate::aggregator::ReportRow;
use crate::events::{ClickEvent, OpenEvent};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::fmt::Write;

pub const DISPLAY_FORMAT: &str = "%d/%m/%Y %H:%M";

/// `DD/MM/YYYY HH:MM` in the report time zone.
pub fn format_local(time: &DateTime<Utc>, tz: Tz) -> String {
    time.with_timezone(&tz).format(DISPLAY_FORMAT).to_string()
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn table(title: &str, headers: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut html = format!("<h2>{}</h2><table border='1' cellpadding='6'><tr>", escape_html(title));
    for header in headers {
        let _ = write!(html, "<th>{}</th>", escape_html(header));
    }
    html.push_str("</tr>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            let _ = write!(html, "<td>{}</td>", escape_html(&cell));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");
    html
}

pub fn open_report_html(rows: &[ReportRow], tz: Tz) -> String {
    table(
        "Opens by sender and recipient",
        &["Sender", "Recipient", "First sent", "First opened", "Real opens", "Devices"],
        rows.iter()
            .map(|row| {
                vec![
                    row.sender.clone(),
                    row.recipient.clone(),
                    format_local(&row.first_sent, tz),
                    format_local(&row.first_opened, tz),
                    row.real_opens.to_string(),
                    row.devices.to_string(),
                ]
            })
            .collect(),
    )
}

pub fn raw_opens_html(events: &[OpenEvent], tz: Tz) -> String {
    table(
        "Latest opens",
        &["Sender", "Recipient", "Sent", "Opened", "Delay (s)", "IP", "User agent"],
        events
            .iter()
            .map(|event| {
                vec![
                    event.sender.clone(),
                    event.recipient.clone(),
                    format_local(&event.sent_at, tz),
                    format_local(&event.opened_at, tz),
                    event.delay_seconds.to_string(),
                    event.client_ip.clone(),
                    event.user_agent.clone(),
                ]
            })
            .collect(),
    )
}

pub fn clicks_html(events: &[ClickEvent], tz: Tz) -> String {
    table(
        "Latest clicks",
        &[
            "Sender",
            "Recipient",
            "Clicked",
            "IP",
            "Browser",
            "OS",
            "Country",
            "Mail server",
            "Clicks",
            "Destination",
        ],
        events
            .iter()
            .map(|event| {
                vec![
                    event.sender.clone(),
                    event.recipient.clone(),
                    format_local(&event.clicked_at, tz),
                    event.client_ip.clone(),
                    event.browser.clone(),
                    event.os.clone(),
                    event.country.clone(),
                    event.mail_server.clone(),
                    event.click_count.to_string(),
                    event.url.clone(),
                ]
            })
            .collect(),
    )
}

pub fn error_html(context: &str, err: &anyhow::Error) -> String {
    format!("<p>Error {}: {}</p>", escape_html(context), escape_html(&format!("{err:#}")))
}

/// Fixed-width table for the CLI.
pub fn open_report_text(rows: &[ReportRow], tz: Tz) -> String {
    let mut out = format!(
        "{:<32} {:<32} {:<16} {:<16} {:>5}  {}\n",
        "SENDER", "RECIPIENT", "FIRST SENT", "FIRST OPENED", "REAL", "DEVICES"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<32} {:<32} {:<16} {:<16} {:>5}  {}",
            row.sender,
            row.recipient,
            format_local(&row.first_sent, tz),
            format_local(&row.first_opened, tz),
            row.real_opens,
            row.devices
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{DeviceClass, DeviceSet};
    use chrono::TimeZone;
    use chrono_tz::America::Santiago;

    #[test]
    fn test_format_local_santiago() {
        // January: Chile summer time, UTC-3.
        let summer = Utc.with_ymd_and_hms(2024, 1, 15, 15, 30, 0).unwrap();
        assert_eq!(format_local(&summer, Santiago), "15/01/2024 12:30");
        // July: standard time, UTC-4.
        let winter = Utc.with_ymd_and_hms(2024, 7, 15, 15, 30, 0).unwrap();
        assert_eq!(format_local(&winter, Santiago), "15/07/2024 11:30");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_open_report_html_escapes_cells() {
        let mut devices = DeviceSet::default();
        devices.insert(DeviceClass::Ios);
        let row = ReportRow {
            sender: "<script>@x.com".to_string(),
            recipient: "b@y.com".to_string(),
            first_sent: Utc.with_ymd_and_hms(2024, 1, 15, 15, 30, 0).unwrap(),
            first_opened: Utc.with_ymd_and_hms(2024, 1, 15, 15, 31, 0).unwrap(),
            real_opens: 2,
            devices,
        };
        let html = open_report_html(&[row], Santiago);
        assert!(html.contains("&lt;script&gt;@x.com"));
        assert!(html.contains("<td>15/01/2024 12:31</td>"));
        assert!(html.contains("<td>2</td><td>iOS</td>"));
    }
}

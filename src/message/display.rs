//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Sealpost.
//
// Sealpost is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Sealpost is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Sealpost. If not, see <http://www.gnu.org/licenses/>.

//! Bodies shown in place of the content of protected messages.

/// Shown while a parse job is running.
pub const WAIT_TEMPLATE: &str = "<html><head></head><body>\
<table border=\"0\" width=\"100%\" cellspacing=\"1\" cellpadding=\"1\" \
bgcolor=\"#0069cc\"><tr><td bgcolor=\"#e0f0ff\"><center>\
<br/>Please wait while the message is being decrypted / verified...\
<br/><br/></center></td></tr></table></body></html>";

/// Written over the plaintext before a processed message is persisted.
pub const WIPE_TEMPLATE: &str = "<html><head></head><body>\
<table border=\"0\" width=\"100%\" cellspacing=\"1\" cellpadding=\"1\" \
bgcolor=\"#0069cc\"><tr><td bgcolor=\"#0080ff\">\
<p><span style=\"font-weight:600; background-color:#0080ff;\">\
<center>This message is protected</center></span></p></td></tr>\
<tr><td bgcolor=\"#e0f0ff\"><center>\
<br/>Open this message to decrypt and verify it.\
<br/>Opening any attachments while this message is shown will only give \
you access to encrypted data.</center><br/><br/></td></tr></table>\
</body></html>";

/// Whether `body` looks like an HTML document.
pub fn is_html_body(body: &str) -> bool {
    (body.contains("<HTML>") && body.contains("</HTML>"))
        || (body.contains("<html>") && body.contains("</html>"))
}

/// Make the line breaks of a plain text survive being shown as HTML.
pub fn add_html_line_endings(body: &str) -> String {
    body.replace('\n', "&nbsp;<br>\n")
}

/// Escape `text` for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Render the plain `text` of a failure as an HTML body.
pub fn error_html(text: &str) -> String {
    format!(
        "<html><head></head><body><pre>{}</pre></body></html>",
        add_html_line_endings(&escape_html(text)),
    )
}

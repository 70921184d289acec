// src/dirlist.rs
//
// Renders the HTML directory listing a Dir artifact carries. The listing
// is built once, when the artifact enters the cache, and served as a
// plain buffered payload afterwards.

use crate::mime;
use std::io::Write;
use std::path::Path;

pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

impl ListingEntry {
    fn icon(&self) -> &'static str {
        if self.is_dir {
            "folder"
        } else {
            "file"
        }
    }

    fn type_label(&self) -> &'static str {
        if self.is_dir {
            "directory"
        } else {
            mime::mime_type_for(Path::new(&self.name))
        }
    }
}

/// Human-readable size: unit picked from {B, KiB, MiB, GiB} by floor
/// powers of 1024.
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = size;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && value >= 1024 {
        value /= 1024;
        unit += 1;
    }
    format!("{} {}", value, UNITS[unit])
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the listing page. `display_path` is the request path shown in
/// the title; `entries` has dot-files already excluded.
pub fn render(display_path: &str, entries: &[ListingEntry]) -> Vec<u8> {
    let title = escape_html(display_path);
    let mut out = Vec::with_capacity(512 + entries.len() * 128);

    let _ = write!(
        out,
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n\
         <body>\n<h1>Index of {title}</h1>\n<table>\n\
         <tr><th></th><th>Name</th><th>Type</th><th>Size</th></tr>\n",
    );

    for entry in entries {
        let name = escape_html(&entry.name);
        let slash = if entry.is_dir { "/" } else { "" };
        let _ = write!(
            out,
            "<tr><td class=\"{icon}\"></td>\
             <td><a href=\"{name}{slash}\">{name}{slash}</a></td>\
             <td>{kind}</td><td>{size}</td></tr>\n",
            icon = entry.icon(),
            kind = entry.type_label(),
            size = format_size(entry.size),
        );
    }

    let _ = out.write_all(b"</table>\n</body>\n</html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_units_floor_by_1024() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1 KiB");
        assert_eq!(format_size(1536), "1 KiB");
        assert_eq!(format_size(1024 * 1024), "1 MiB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5 GiB");
        // Caps at GiB
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 * 1024), "3072 GiB");
    }

    #[test]
    fn test_render_lists_entries_with_icons() {
        let entries = vec![
            ListingEntry {
                name: "docs".into(),
                is_dir: true,
                size: 4096,
            },
            ListingEntry {
                name: "a.txt".into(),
                is_dir: false,
                size: 12,
            },
        ];
        let html = String::from_utf8(render("/sub/", &entries)).unwrap();
        assert!(html.contains("Index of /sub/"));
        assert!(html.contains("class=\"folder\""));
        assert!(html.contains("class=\"file\""));
        assert!(html.contains("href=\"docs/\""));
        assert!(html.contains(">directory<"));
        assert!(html.contains(">text/plain<"));
        assert!(html.contains("12 B"));
    }

    #[test]
    fn test_render_escapes_names() {
        let entries = vec![ListingEntry {
            name: "a<b>.txt".into(),
            is_dir: false,
            size: 1,
        }];
        let html = String::from_utf8(render("/", &entries)).unwrap();
        assert!(html.contains("a&lt;b&gt;.txt"));
        assert!(!html.contains("a<b>.txt"));
    }
}

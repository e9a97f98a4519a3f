//! Verbose listings of candidate groups, rendered as aligned text tables.

use crate::inventory::{FileRecord, SegmentRecord};
use crate::key::{KeyClass, SegmentRole};

const COLUMN_GAP: usize = 2;

/// Column-aligned table with a dashed rule under the header.
#[derive(Debug, Default)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<S: Into<String>>(header: impl IntoIterator<Item = S>) -> Self {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row<S: Into<String>>(&mut self, row: impl IntoIterator<Item = S>) {
        let row: Vec<String> = row.into_iter().map(Into::into).collect();
        debug_assert_eq!(row.len(), self.header.len());
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.header.iter().map(String::len).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        render_line(&mut out, &self.header, &widths);
        let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        render_line(&mut out, &rule, &widths);
        for row in &self.rows {
            render_line(&mut out, row, &widths);
        }
        out
    }
}

fn render_line(out: &mut String, cells: &[String], widths: &[usize]) {
    for (index, (cell, width)) in cells.iter().zip(widths).enumerate() {
        out.push_str(cell);
        if index + 1 < cells.len() {
            for _ in 0..(width - cell.len() + COLUMN_GAP) {
                out.push(' ');
            }
        }
    }
    out.push('\n');
}

fn class_label(class: KeyClass) -> &'static str {
    match class {
        KeyClass::Primary => "primary",
        KeyClass::Secondary => "secondary",
        KeyClass::Data => "data",
    }
}

fn role_label(role: SegmentRole) -> &'static str {
    match role {
        SegmentRole::Base => "base",
        SegmentRole::TreeIndex => "tree-index",
        SegmentRole::Meta => "meta",
        SegmentRole::Stage(_) => "stage",
    }
}

fn stage_cell(role: SegmentRole) -> String {
    match role.stage_ordinal() {
        Some(ordinal) => format!("{ordinal:03x}"),
        None => "-".to_string(),
    }
}

fn name_cell(namespace: Option<&str>) -> String {
    namespace.unwrap_or("-").to_string()
}

/// Table of group members about to be backed up.
pub fn segment_table<'a>(
    members: impl IntoIterator<Item = &'a SegmentRecord>,
    with_crc: bool,
) -> Table {
    let mut header = vec![
        "key", "shmid", "uid", "gid", "mode", "natt", "segsz", "inst", "nsid", "name", "class",
        "role", "stage",
    ];
    if with_crc {
        header.push("crc32");
    }
    let mut table = Table::new(header);
    for member in members {
        let mut row = vec![
            format!("{:08x}", member.raw_key),
            member.shmid.to_string(),
            member.uid.to_string(),
            member.gid.to_string(),
            format!("0{:o}", member.mode),
            member.attach_count.to_string(),
            member.byte_size.to_string(),
            member.key.instance.to_string(),
            member.key.namespace_id.to_string(),
            name_cell(member.namespace.as_deref()),
            class_label(member.key.class).to_string(),
            role_label(member.key.role).to_string(),
            stage_cell(member.key.role),
        ];
        if with_crc {
            row.push(match member.crc32 {
                Some(crc) => format!("{crc:08x}"),
                None => "-".to_string(),
            });
        }
        table.push_row(row);
    }
    table
}

/// Table of group members about to be restored.
pub fn file_table<'a>(members: impl IntoIterator<Item = &'a FileRecord>) -> Table {
    let mut table = Table::new([
        "key", "uid", "gid", "mode", "segsz", "filesz", "gz", "inst", "nsid", "name", "class",
        "role", "stage",
    ]);
    for member in members {
        table.push_row([
            format!("{:08x}", member.raw_key),
            member.uid.to_string(),
            member.gid.to_string(),
            format!("0{:o}", member.mode & 0o7777),
            member.segment_size.to_string(),
            member.file_size.to_string(),
            if member.compressed { "yes" } else { "no" }.to_string(),
            member.key.instance.to_string(),
            member.key.namespace_id.to_string(),
            name_cell(member.namespace.as_deref()),
            class_label(member.key.class).to_string(),
            role_label(member.key.role).to_string(),
            stage_cell(member.key.role),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SegmentKey;

    #[test]
    fn columns_align_to_the_widest_cell() {
        let mut table = Table::new(["key", "size"]);
        table.push_row(["ae001000", "42"]);
        table.push_row(["ae001001", "1048576"]);
        let rendered = table.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "key       size");
        assert_eq!(lines[1], "--------  -------");
        assert_eq!(lines[2], "ae001000  42");
        assert_eq!(lines[3], "ae001001  1048576");
    }

    #[test]
    fn segment_rows_carry_decoded_fields() {
        let record = SegmentRecord {
            key: SegmentKey::decode(0xAE00_1100).unwrap(),
            raw_key: 0xAE00_1100,
            shmid: 7,
            uid: 0,
            gid: 0,
            mode: 0o660,
            attach_count: 0,
            byte_size: 1024,
            namespace: None,
            base: None,
            meta_arena_count: None,
            crc32: Some(0xDEAD_BEEF),
        };
        let rendered = segment_table([&record], true).render();
        assert!(rendered.contains("ae001100"));
        assert!(rendered.contains("primary"));
        assert!(rendered.contains("stage"));
        assert!(rendered.contains("100"));
        assert!(rendered.contains("deadbeef"));
    }
}

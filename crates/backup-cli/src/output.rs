use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

/// Print rows under `columns` (title, alignment). Widths count characters,
/// not bytes, so hand-edited metadata cannot skew the layout.
pub fn print_table(columns: &[(&str, Align)], rows: &[Vec<String>]) {
    print!("{}", render_table(columns, rows));
}

fn render_table(columns: &[(&str, Align)], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|(title, _)| title.chars().count()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let titles: Vec<String> = columns.iter().map(|(title, _)| title.to_string()).collect();
    let rules: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();

    let mut out = String::new();
    push_row(&mut out, columns, &widths, &titles);
    push_row(&mut out, columns, &widths, &rules);
    for row in rows {
        push_row(&mut out, columns, &widths, row);
    }
    out
}

fn push_row(out: &mut String, columns: &[(&str, Align)], widths: &[usize], cells: &[String]) {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .zip(columns)
        .map(|((cell, &w), &(_, align))| {
            let pad = " ".repeat(w.saturating_sub(cell.chars().count()));
            match align {
                Align::Left => format!("{cell}{pad}"),
                Align::Right => format!("{pad}{cell}"),
            }
        })
        .collect();
    out.push_str(padded.join("  ").trim_end());
    out.push('\n');
}

/// Bytes rendered with a binary unit, e.g. `1.5 MiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

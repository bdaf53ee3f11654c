
use crate::text::floor_char_boundary;

pub const DEFAULT_CHUNK_CHARS: usize = 512;

const HEADING_MAX_BYTES: usize = 120;
const SENTENCE_LOOKBACK_BYTES: usize = 256;

const CJK_SECTION_SUFFIXES: [&str; 4] = ["章", "节", "条", "部分"];
const CJK_NUMERALS: &str = "一二三四五六七八九十百千零〇两";
const SENTENCE_DELIMITERS: [char; 9] = ['\n', '.', '!', '?', ';', '。', '！', '？', '；'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    Heading,
    List,
    Table,
    Paragraph,
}

/// Split a document into chunks bounded by `max_chars` bytes, aligned to
/// semantic boundaries.
///
/// Lines are classified as heading, list item, table line, or paragraph;
/// consecutive lines of one class form a block. Headings and blank lines are
/// hard boundaries. Blocks between hard boundaries are packed greedily into
/// chunks joined with blank lines; a block longer than the budget is split at
/// sentence boundaries, falling back to a codepoint-aligned cut.
pub fn split_text_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = if max_chars == 0 {
        DEFAULT_CHUNK_CHARS
    } else {
        max_chars
    };

    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let groups = collect_block_groups(&normalized);

    let mut chunks = Vec::new();
    for group in groups {
        pack_group(&group, max_chars, &mut chunks);
    }
    chunks
}

/// Blocks that may be packed together: headings and blank lines start a new
/// group, class changes only start a new block within the group.
fn collect_block_groups(text: &str) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut group: Vec<String> = Vec::new();
    let mut block = String::new();
    let mut block_class: Option<LineClass> = None;

    let flush_block = |group: &mut Vec<String>, block: &mut String| {
        if !block.trim().is_empty() {
            group.push(std::mem::take(block));
        } else {
            block.clear();
        }
    };
    let flush_group = |groups: &mut Vec<Vec<String>>, group: &mut Vec<String>| {
        if !group.is_empty() {
            groups.push(std::mem::take(group));
        }
    };

    for line in text.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush_block(&mut group, &mut block);
            flush_group(&mut groups, &mut group);
            block_class = None;
            continue;
        }

        let class = classify_line(line, trimmed);
        if class == LineClass::Heading {
            flush_block(&mut group, &mut block);
            flush_group(&mut groups, &mut group);
            groups.push(vec![line.to_string()]);
            block_class = None;
            continue;
        }

        if block_class != Some(class) {
            flush_block(&mut group, &mut block);
            block_class = Some(class);
        }
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(line);
    }
    flush_block(&mut group, &mut block);
    flush_group(&mut groups, &mut group);

    groups
}

fn pack_group(blocks: &[String], max_chars: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();

    let emit = |piece: &str, chunks: &mut Vec<String>| {
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
    };

    for block in blocks {
        if block.len() > max_chars {
            emit(&std::mem::take(&mut current), chunks);
            for piece in split_long_block(block, max_chars) {
                emit(&piece, chunks);
            }
            continue;
        }
        if !current.is_empty() && current.len() + 2 + block.len() > max_chars {
            emit(&std::mem::take(&mut current), chunks);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(block);
    }
    emit(&current, chunks);
}

/// Cut an oversized block at the last sentence boundary within a look-back
/// window, or on a codepoint boundary when none exists.
fn split_long_block(block: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = block;
    while rest.len() > max_chars {
        let window_end = floor_char_boundary(rest, max_chars);
        if window_end == 0 {
            break;
        }
        let cut = find_sentence_cut(rest, window_end).unwrap_or(window_end);
        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// End offset of the last sentence delimiter within the look-back window, if
/// one exists strictly inside the window.
fn find_sentence_cut(text: &str, window_end: usize) -> Option<usize> {
    let lookback_start = window_end.saturating_sub(SENTENCE_LOOKBACK_BYTES);
    let mut cut = None;
    for (idx, ch) in text[..window_end].char_indices() {
        let end = idx + ch.len_utf8();
        if end >= lookback_start && SENTENCE_DELIMITERS.contains(&ch) && end < window_end {
            cut = Some(end);
        }
    }
    cut.filter(|&c| c > 0)
}

fn classify_line(raw: &str, trimmed: &str) -> LineClass {
    if is_heading(trimmed) {
        LineClass::Heading
    } else if is_list_item(trimmed) {
        LineClass::List
    } else if is_table_line(raw) {
        LineClass::Table
    } else {
        LineClass::Paragraph
    }
}

fn is_heading(line: &str) -> bool {
    if line.len() > HEADING_MAX_BYTES {
        return false;
    }
    if line.starts_with("附录") || line.starts_with("目录") {
        return true;
    }
    if is_cjk_chapter_marker(line) || is_cjk_enumeration(line) {
        return true;
    }
    is_numeric_heading(line)
}

/// `第...章/节/条/部分` with a short numeral run in the middle.
fn is_cjk_chapter_marker(line: &str) -> bool {
    let Some(rest) = line.strip_prefix('第') else {
        return false;
    };
    let mut numerals = 0;
    for (idx, ch) in rest.char_indices() {
        if ch.is_ascii_digit() || CJK_NUMERALS.contains(ch) {
            numerals += 1;
            if numerals > 8 {
                return false;
            }
            continue;
        }
        let tail = &rest[idx..];
        return numerals > 0
            && CJK_SECTION_SUFFIXES
                .iter()
                .any(|suffix| tail.starts_with(suffix));
    }
    false
}

/// CJK enumeration headings such as `一、`.
fn is_cjk_enumeration(line: &str) -> bool {
    let numerals: usize = line
        .chars()
        .take_while(|ch| CJK_NUMERALS.contains(*ch))
        .count();
    if numerals == 0 || numerals > 4 {
        return false;
    }
    line.chars().nth(numerals) == Some('、')
}

/// `N`, `N.`, `N.N`, `N.N.N`, optionally closed by `)`, `）`, or `、`,
/// standing alone or followed by a title.
fn is_numeric_heading(line: &str) -> bool {
    let mut rest = line;
    let mut groups = 0;
    loop {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return false;
        }
        groups += 1;
        rest = &rest[digits..];
        if let Some(after) = rest.strip_prefix('.') {
            if after.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                if groups >= 3 {
                    return false;
                }
                rest = after;
                continue;
            }
            rest = after;
        }
        break;
    }
    for marker in [")", "）", "、"] {
        if let Some(after) = rest.strip_prefix(marker) {
            rest = after;
            break;
        }
    }
    rest.is_empty() || rest.starts_with(char::is_whitespace)
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ")
        || line.starts_with("* ")
        || line.starts_with('•')
        || line.starts_with('(')
        || line.starts_with('（')
    {
        return true;
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return false;
    }
    let rest = &line[digits..];
    rest.starts_with(')') || rest.starts_with('.') || rest.starts_with('、')
}

fn is_table_line(line: &str) -> bool {
    if line.matches('|').count() >= 2 {
        return true;
    }
    wide_space_runs(line) >= 2
}

/// Runs of three or more consecutive spaces, the usual plain-text column gap.
fn wide_space_runs(line: &str) -> usize {
    let mut runs = 0;
    let mut len = 0;
    for ch in line.chars() {
        if ch == ' ' {
            len += 1;
        } else {
            if len >= 3 {
                runs += 1;
            }
            len = 0;
        }
    }
    if len >= 3 {
        runs += 1;
    }
    runs
}

//! Recognizes the `<changes>…</changes>` envelope in arbitrary model output
//! and parses it into a flat list of [`FileEdit`] records.
//!
//! Per the design notes: locate the envelope by simple substring search
//! before parsing, never auto-correct malformed XML, and treat `<content>`
//! and `<path>` payloads as opaque CDATA so entity-decoding never touches
//! user source text.

use codeforge_core::{EditKind, FileEdit};
use codeforge_errors::ParseError;
use quick_xml::Reader;
use quick_xml::events::Event;

/// Finds the first `<changes>…</changes>` region in `text`, including the
/// self-closing `<changes/>` shape. Returns `None` if no complete envelope
/// is present — an unterminated or missing envelope is reported the same
/// way by the caller (§7: envelope parse failure aborts the apply).
pub fn locate_envelope(text: &str) -> Option<&str> {
    let start = text.find("<changes")?;
    let open_tag_end = text[start..].find('>')? + start + 1;
    let open_tag = &text[start..open_tag_end];
    if open_tag.trim_end().ends_with("/>") {
        return Some(open_tag);
    }
    const END_TAG: &str = "</changes>";
    let rel_end = text[open_tag_end..].find(END_TAG)?;
    Some(&text[start..open_tag_end + rel_end + END_TAG.len()])
}

/// Locates and parses the envelope in `model_output`, yielding the flat
/// edit list. A missing envelope or malformed XML is a fatal `ParseError`;
/// no partial edit list is ever returned on failure.
pub fn parse(model_output: &str) -> Result<Vec<FileEdit>, ParseError> {
    let envelope = locate_envelope(model_output).ok_or(ParseError::EnvelopeNotFound)?;
    parse_envelope(envelope)
}

#[derive(Default)]
struct ChangeBuilder {
    kind: Option<String>,
    file: Option<String>,
    description: String,
    content: Option<String>,
}

#[derive(Default)]
struct BlockBuilder {
    name_attr: Option<String>,
    path: Option<String>,
    content: Option<String>,
    own_text: String,
}

#[derive(Default)]
struct FileUpdateBuilder {
    file: Option<String>,
    description: String,
    blocks: Vec<BlockBuilder>,
}

/// Parses an already-located `<changes>…</changes>` string as XML with
/// CDATA, accepting both the full-file `<change>` shape and the block
/// `<file_update>`/`<block>` shape (§4.7). Unknown elements and attributes
/// anywhere inside are ignored rather than rejected.
pub fn parse_envelope(envelope: &str) -> Result<Vec<FileEdit>, ParseError> {
    let mut reader = Reader::from_str(envelope);
    reader.config_mut().trim_text(true);

    let mut edits = Vec::new();
    let mut text_stack: Vec<String> = Vec::new();
    let mut cur_change: Option<ChangeBuilder> = None;
    let mut cur_file_update: Option<FileUpdateBuilder> = None;
    let mut cur_block: Option<BlockBuilder> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ParseError::MalformedXml(e.to_string()))?;

        match event {
            Event::Eof => break,
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                text_stack.push(String::new());
                match name.as_str() {
                    "change" => {
                        let kind = attr_value(&e, "type");
                        cur_change = Some(ChangeBuilder {
                            kind,
                            ..Default::default()
                        });
                    }
                    "file_update" => {
                        cur_file_update = Some(FileUpdateBuilder::default());
                    }
                    "block" => {
                        let name_attr = attr_value(&e, "name");
                        cur_block = Some(BlockBuilder {
                            name_attr,
                            ..Default::default()
                        });
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                // Self-closing leaf (e.g. `<description/>`); treat as an
                // immediate start+end pair with no text.
                let name = local_name(e.name().as_ref());
                if name == "block" {
                    let name_attr = attr_value(&e, "name");
                    edits_from_block_end(&mut cur_file_update, BlockBuilder {
                        name_attr,
                        ..Default::default()
                    });
                }
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| ParseError::MalformedXml(err.to_string()))?;
                if let Some(buf) = text_stack.last_mut() {
                    buf.push_str(&text);
                }
            }
            Event::CData(e) => {
                let bytes = e.into_inner();
                let text = String::from_utf8_lossy(&bytes);
                if let Some(buf) = text_stack.last_mut() {
                    buf.push_str(&text);
                }
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                let own_text = text_stack.pop().unwrap_or_default();
                match name.as_str() {
                    "file" => {
                        let value = own_text.trim().to_string();
                        if let Some(c) = cur_change.as_mut() {
                            c.file = Some(value);
                        } else if let Some(fu) = cur_file_update.as_mut() {
                            fu.file = Some(value);
                        }
                    }
                    "description" => {
                        if let Some(c) = cur_change.as_mut() {
                            c.description = own_text.trim().to_string();
                        } else if let Some(fu) = cur_file_update.as_mut() {
                            fu.description = own_text.trim().to_string();
                        }
                    }
                    "path" => {
                        if let Some(b) = cur_block.as_mut() {
                            b.path = Some(own_text.trim().to_string());
                        }
                    }
                    "content" => {
                        if let Some(b) = cur_block.as_mut() {
                            b.content = Some(own_text);
                        } else if let Some(c) = cur_change.as_mut() {
                            c.content = Some(own_text);
                        }
                    }
                    "block" => {
                        if let Some(mut b) = cur_block.take() {
                            b.own_text = own_text;
                            edits_from_block_end(&mut cur_file_update, b);
                        }
                    }
                    "change" => {
                        if let Some(c) = cur_change.take() {
                            edits.push(finish_change(c)?);
                        }
                    }
                    "file_update" => {
                        if let Some(fu) = cur_file_update.take() {
                            edits.extend(finish_file_update(fu)?);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    Ok(edits)
}

/// Appends a completed `<block>` into the `<file_update>` currently being
/// built. Called from both the `Event::End("block")` and `Event::Empty`
/// paths so a self-closing block (no content at all) still registers.
fn edits_from_block_end(cur_file_update: &mut Option<FileUpdateBuilder>, block: BlockBuilder) {
    if let Some(fu) = cur_file_update.as_mut() {
        fu.blocks.push(block);
    }
}

fn finish_change(c: ChangeBuilder) -> Result<FileEdit, ParseError> {
    let file = c.file.ok_or(ParseError::MissingFile)?;
    match c.kind.as_deref() {
        Some("delete") => {
            if c.content.is_some() {
                return Err(ParseError::UnexpectedContent { path: file });
            }
            Ok(FileEdit {
                kind: EditKind::Delete,
                path: file,
                description: c.description,
                block_path: None,
                content: None,
            })
        }
        Some("update") | None => {
            let content = c.content.ok_or_else(|| ParseError::MissingContent {
                path: file.clone(),
            })?;
            Ok(FileEdit {
                kind: EditKind::Update,
                path: file,
                description: c.description,
                block_path: None,
                content: Some(content),
            })
        }
        Some(other) => Err(ParseError::UnknownChangeType {
            path: file,
            kind: other.to_string(),
        }),
    }
}

fn finish_file_update(fu: FileUpdateBuilder) -> Result<Vec<FileEdit>, ParseError> {
    let file = fu.file.ok_or(ParseError::MissingFile)?;
    let mut out = Vec::with_capacity(fu.blocks.len());
    for block in fu.blocks {
        let (path, content) = match (block.path, block.content) {
            (Some(path), Some(content)) => (path, content),
            (None, None) if block.name_attr.is_some() => {
                (block.name_attr.unwrap(), block.own_text)
            }
            _ => {
                return Err(ParseError::MalformedBlock { path: file });
            }
        };
        out.push(FileEdit {
            kind: EditKind::Update,
            path: file.clone(),
            description: fu.description.clone(),
            block_path: Some(path),
            content: Some(content),
        });
    }
    Ok(out)
}

fn local_name(raw: &[u8]) -> String {
    let full = String::from_utf8_lossy(raw);
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

fn attr_value(start: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    start.attributes().filter_map(|a| a.ok()).find_map(|a| {
        if local_name(a.key.as_ref()) == key {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_envelope_finds_plain_region() {
        let text = "here is my answer\n<changes><change type=\"update\"><file>a.ts</file><content><![CDATA[x]]></content></change></changes>\ndone";
        let env = locate_envelope(text).unwrap();
        assert!(env.starts_with("<changes>"));
        assert!(env.ends_with("</changes>"));
    }

    #[test]
    fn locate_envelope_handles_self_closing() {
        let text = "no changes needed <changes/>";
        let env = locate_envelope(text).unwrap();
        assert_eq!(env, "<changes/>");
    }

    #[test]
    fn locate_envelope_missing_returns_none() {
        assert!(locate_envelope("just some prose").is_none());
    }

    #[test]
    fn parse_empty_envelope_yields_no_edits() {
        let edits = parse("<changes/>").unwrap();
        assert!(edits.is_empty());
        let edits = parse("<changes></changes>").unwrap();
        assert!(edits.is_empty());
    }

    #[test]
    fn parse_full_file_update_and_delete() {
        let xml = r#"<changes>
            <change type="update">
                <file>src/a.ts</file>
                <description>add greeting</description>
                <content><![CDATA[export const a = 1;]]></content>
            </change>
            <change type="delete">
                <file>src/old.ts</file>
            </change>
        </changes>"#;
        let edits = parse(xml).unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].kind, EditKind::Update);
        assert_eq!(edits[0].path, "src/a.ts");
        assert_eq!(edits[0].content.as_deref(), Some("export const a = 1;"));
        assert!(edits[0].block_path.is_none());
        assert_eq!(edits[1].kind, EditKind::Delete);
        assert!(edits[1].content.is_none());
    }

    #[test]
    fn parse_delete_with_content_is_error() {
        let xml = r#"<changes><change type="delete"><file>a.ts</file><content><![CDATA[x]]></content></change></changes>"#;
        let err = parse(xml).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedContent { .. }));
    }

    #[test]
    fn parse_update_missing_content_is_error() {
        let xml = r#"<changes><change type="update"><file>a.ts</file></change></changes>"#;
        let err = parse(xml).unwrap_err();
        assert!(matches!(err, ParseError::MissingContent { .. }));
    }

    #[test]
    fn parse_block_format_with_child_elements() {
        let xml = r#"<changes>
            <file_update>
                <file>src/a.ts</file>
                <description>rename greet</description>
                <operations>
                    <block>
                        <path><![CDATA[greet]]></path>
                        <content><![CDATA[export function greet() { return "hello"; }]]></content>
                    </block>
                </operations>
            </file_update>
        </changes>"#;
        let edits = parse(xml).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].block_path.as_deref(), Some("greet"));
        assert_eq!(
            edits[0].content.as_deref(),
            Some("export function greet() { return \"hello\"; }")
        );
    }

    #[test]
    fn parse_block_format_legacy_attribute_shape() {
        let xml = r#"<changes>
            <file_update>
                <file>src/a.ts</file>
                <operations>
                    <block name="greet"><![CDATA[export function greet() { return 2; }]]></block>
                </operations>
            </file_update>
        </changes>"#;
        let edits = parse(xml).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].block_path.as_deref(), Some("greet"));
        assert_eq!(
            edits[0].content.as_deref(),
            Some("export function greet() { return 2; }")
        );
    }

    #[test]
    fn parse_multiple_blocks_in_one_file_update() {
        let xml = r#"<changes>
            <file_update>
                <file>src/a.ts</file>
                <operations>
                    <block><path><![CDATA[$imports]]></path><content><![CDATA[import c from "c";]]></content></block>
                    <block name="X"><![CDATA[export const X = 2;]]></block>
                </operations>
            </file_update>
        </changes>"#;
        let edits = parse(xml).unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].block_path.as_deref(), Some("$imports"));
        assert_eq!(edits[1].block_path.as_deref(), Some("X"));
    }

    #[test]
    fn unknown_child_elements_are_ignored() {
        let xml = r#"<changes>
            <metadata><model>gpt</model></metadata>
            <change type="update" extra="attr">
                <file>a.ts</file>
                <reasoning>because</reasoning>
                <content><![CDATA[x]]></content>
            </change>
        </changes>"#;
        let edits = parse(xml).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].content.as_deref(), Some("x"));
    }

    #[test]
    fn unterminated_envelope_is_not_found() {
        let text = "<changes><change><file>x</file><content>unterminated...";
        let err = parse(text).unwrap_err();
        assert!(matches!(err, ParseError::EnvelopeNotFound));
    }

    #[test]
    fn unknown_change_type_is_error() {
        let xml = r#"<changes><change type="rename"><file>a.ts</file></change></changes>"#;
        let err = parse(xml).unwrap_err();
        assert!(matches!(err, ParseError::UnknownChangeType { .. }));
    }
}

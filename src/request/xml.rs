//! # XML 事件流
//!
//! `XmlCursor` 是只进、单遍的拉取式游标：调用方逐个取出
//! 开始标签 / 结束标签 / 文本 / 文档结束事件，可以随时提前停止，不构建文档树。
//! 自闭合标签会依次产生开始与结束两个事件。

use std::io::Cursor;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::RequestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    StartTag {
        name: String,
        attributes: Vec<(String, String)>,
    },
    EndTag {
        name: String,
    },
    Text(String),
    EndDocument,
}

impl XmlEvent {
    /// 开始标签上的属性值；其他事件返回 `None`。
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            Self::StartTag { attributes, .. } => attributes
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

pub struct XmlCursor {
    reader: Reader<Cursor<Vec<u8>>>,
    buf: Vec<u8>,
    pending_end: Option<String>,
    finished: bool,
}

impl std::fmt::Debug for XmlCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlCursor")
            .field("position", &self.reader.buffer_position())
            .field("finished", &self.finished)
            .finish()
    }
}

impl XmlCursor {
    pub fn new(document: Vec<u8>) -> Self {
        let mut reader = Reader::from_reader(Cursor::new(document));
        reader.config_mut().trim_text(true);

        Self {
            reader,
            buf: Vec::new(),
            pending_end: None,
            finished: false,
        }
    }

    /// 读取下一个事件。文档结束后返回 `Ok(None)`。
    pub fn next_event(&mut self) -> Result<Option<XmlEvent>, RequestError> {
        if let Some(name) = self.pending_end.take() {
            return Ok(Some(XmlEvent::EndTag { name }));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf).map_err(|e| {
                RequestError::DecodeFailure(format!(
                    "XML 解析失败（位置 {}）：{}",
                    self.reader.error_position(),
                    e
                ))
            });

            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    self.finished = true;
                    return Err(error);
                }
            };

            match event {
                Event::Start(start) => return start_tag(&start).map(Some),
                Event::Empty(start) => {
                    let event = start_tag(&start)?;
                    if let XmlEvent::StartTag { name, .. } = &event {
                        self.pending_end = Some(name.clone());
                    }
                    return Ok(Some(event));
                }
                Event::End(end) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    return Ok(Some(XmlEvent::EndTag { name }));
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| RequestError::DecodeFailure(format!("XML 文本反转义失败：{}", e)))?;
                    if !text.is_empty() {
                        return Ok(Some(XmlEvent::Text(text.into_owned())));
                    }
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if !text.is_empty() {
                        return Ok(Some(XmlEvent::Text(text)));
                    }
                }
                Event::Eof => {
                    self.finished = true;
                    return Ok(Some(XmlEvent::EndDocument));
                }
                _ => {}
            }
        }
    }
}

impl Iterator for XmlCursor {
    type Item = Result<XmlEvent, RequestError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

fn start_tag(start: &BytesStart<'_>) -> Result<XmlEvent, RequestError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();

    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| RequestError::DecodeFailure(format!("XML 属性解析失败：{}", e)))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| RequestError::DecodeFailure(format!("XML 属性反转义失败：{}", e)))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(XmlEvent::StartTag { name, attributes })
}

//! `application/conference-info+xml` documents
//!
//! Writing and parsing of the conference state documents carried by
//! NOTIFY bodies. Only the subset of the format used by the engine is
//! modelled; unknown elements are skipped when parsing.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::device::DeviceState;
use crate::errors::{ConferenceError, Result};
use crate::types::{MediaDirection, SipAddress, StreamType};

const CONFERENCE_INFO_NS: &str = "urn:ietf:params:xml:ns:conference-info";
const EXTENSION_NS: &str = "urn:sipconf:params:xml:ns:conference-info-ext";

/// `state` attribute of documents, users and endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Full,
    Partial,
    Deleted,
}

impl ElementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementState::Full => "full",
            ElementState::Partial => "partial",
            ElementState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(ElementState::Full),
            "partial" => Some(ElementState::Partial),
            "deleted" => Some(ElementState::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableMedia {
    pub media_type: StreamType,
    pub status: MediaDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConferenceDescription {
    pub subject: Option<String>,
    pub available_media: Vec<AvailableMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMedia {
    pub id: String,
    pub media_type: StreamType,
    pub src_id: Option<u32>,
    pub status: MediaDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub entity: SipAddress,
    pub state: ElementState,
    pub status: Option<DeviceState>,
    pub media: Vec<EndpointMedia>,
    pub muted: Option<bool>,
    pub speaking: Option<bool>,
}

impl EndpointInfo {
    pub fn deleted(entity: SipAddress) -> Self {
        Self {
            entity,
            state: ElementState::Deleted,
            status: None,
            media: Vec::new(),
            muted: None,
            speaking: None,
        }
    }

    pub fn direction(&self, stream: StreamType) -> Option<MediaDirection> {
        self.media.iter().find(|m| m.media_type == stream).map(|m| m.status)
    }

    pub fn src_id(&self, stream: StreamType) -> Option<u32> {
        self.media.iter().find(|m| m.media_type == stream).and_then(|m| m.src_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub entity: SipAddress,
    pub state: ElementState,
    pub display_text: Option<String>,
    /// `None` when the element is absent (partial update without roles)
    pub roles: Option<Vec<String>>,
    pub endpoints: Vec<EndpointInfo>,
}

impl UserInfo {
    pub fn deleted(entity: SipAddress) -> Self {
        Self {
            entity,
            state: ElementState::Deleted,
            display_text: None,
            roles: None,
            endpoints: Vec::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> Option<bool> {
        self.roles.as_ref().map(|roles| roles.iter().any(|r| r == role))
    }
}

/// One conference state document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceInfoDocument {
    pub entity: SipAddress,
    pub state: ElementState,
    pub version: u32,
    pub description: Option<ConferenceDescription>,
    pub users: Vec<UserInfo>,
}

impl ConferenceInfoDocument {
    pub fn new(entity: SipAddress, state: ElementState, version: u32) -> Self {
        Self {
            entity,
            state,
            version,
            description: None,
            users: Vec::new(),
        }
    }

    pub fn is_full_state(&self) -> bool {
        self.state == ElementState::Full
    }

    /// Serialize to XML
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new("conference-info");
        root.push_attribute(("xmlns", CONFERENCE_INFO_NS));
        root.push_attribute(("xmlns:cie", EXTENSION_NS));
        root.push_attribute(("entity", self.entity.to_string().as_str()));
        root.push_attribute(("state", self.state.as_str()));
        root.push_attribute(("version", self.version.to_string().as_str()));
        write(&mut writer, Event::Start(root))?;

        if let Some(description) = &self.description {
            write(&mut writer, Event::Start(BytesStart::new("conference-description")))?;
            if let Some(subject) = &description.subject {
                write_text_element(&mut writer, "subject", subject)?;
            }
            if !description.available_media.is_empty() {
                write(&mut writer, Event::Start(BytesStart::new("available-media")))?;
                for (idx, media) in description.available_media.iter().enumerate() {
                    let mut entry = BytesStart::new("entry");
                    entry.push_attribute(("label", (idx + 1).to_string().as_str()));
                    write(&mut writer, Event::Start(entry))?;
                    write_text_element(&mut writer, "type", media.media_type.as_str())?;
                    write_text_element(&mut writer, "status", media.status.as_str())?;
                    write(&mut writer, Event::End(BytesStart::new("entry").to_end()))?;
                }
                write(&mut writer, Event::End(BytesStart::new("available-media").to_end()))?;
            }
            write(&mut writer, Event::End(BytesStart::new("conference-description").to_end()))?;
        }

        write(&mut writer, Event::Start(BytesStart::new("users")))?;
        for user in &self.users {
            write_user(&mut writer, user)?;
        }
        write(&mut writer, Event::End(BytesStart::new("users").to_end()))?;

        write(&mut writer, Event::End(BytesStart::new("conference-info").to_end()))?;

        let xml = writer.into_inner().into_inner();
        String::from_utf8(xml).map_err(|e| ConferenceError::event_package(e.to_string()))
    }

    /// Parse an XML document
    ///
    /// Element text is collected verbatim and handed over when the element
    /// closes, so an empty `<subject/>` or a padded subject reads back as
    /// written. Token values (types, states, booleans) are trimmed.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);

        let mut parser = DocumentParser::default();
        let mut text = String::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    parser.start(e)?;
                    text.clear();
                }
                Ok(Event::Empty(ref e)) => {
                    parser.start(e)?;
                    parser.text("")?;
                    parser.end(e.local_name().as_ref())?;
                    text.clear();
                }
                Ok(Event::Text(ref e)) => {
                    let unescaped = e
                        .unescape()
                        .map_err(|err| ConferenceError::event_package(err.to_string()))?;
                    text.push_str(&unescaped);
                }
                Ok(Event::CData(ref e)) => text.push_str(&String::from_utf8_lossy(e)),
                Ok(Event::End(ref e)) => {
                    parser.text(&text)?;
                    text.clear();
                    parser.end(e.local_name().as_ref())?;
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(ConferenceError::event_package(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        parser.finish()
    }
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| ConferenceError::event_package(e.to_string()))
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesStart::new(name).to_end()))
}

fn write_user(writer: &mut Writer<Cursor<Vec<u8>>>, user: &UserInfo) -> Result<()> {
    let mut start = BytesStart::new("user");
    start.push_attribute(("entity", user.entity.to_string().as_str()));
    start.push_attribute(("state", user.state.as_str()));

    if user.state == ElementState::Deleted {
        return write(writer, Event::Empty(start));
    }

    write(writer, Event::Start(start))?;
    if let Some(display) = &user.display_text {
        write_text_element(writer, "display-text", display)?;
    }
    if let Some(roles) = &user.roles {
        write(writer, Event::Start(BytesStart::new("roles")))?;
        for role in roles {
            write_text_element(writer, "entry", role)?;
        }
        write(writer, Event::End(BytesStart::new("roles").to_end()))?;
    }
    for endpoint in &user.endpoints {
        write_endpoint(writer, endpoint)?;
    }
    write(writer, Event::End(BytesStart::new("user").to_end()))
}

fn write_endpoint(writer: &mut Writer<Cursor<Vec<u8>>>, endpoint: &EndpointInfo) -> Result<()> {
    let mut start = BytesStart::new("endpoint");
    start.push_attribute(("entity", endpoint.entity.to_string().as_str()));
    start.push_attribute(("state", endpoint.state.as_str()));

    if endpoint.state == ElementState::Deleted {
        return write(writer, Event::Empty(start));
    }

    write(writer, Event::Start(start))?;
    if let Some(status) = endpoint.status {
        write_text_element(writer, "status", status.as_status())?;
    }
    for media in &endpoint.media {
        let mut start = BytesStart::new("media");
        start.push_attribute(("id", media.id.as_str()));
        write(writer, Event::Start(start))?;
        write_text_element(writer, "type", media.media_type.as_str())?;
        if let Some(src_id) = media.src_id {
            write_text_element(writer, "src-id", &src_id.to_string())?;
        }
        write_text_element(writer, "status", media.status.as_str())?;
        write(writer, Event::End(BytesStart::new("media").to_end()))?;
    }
    if let Some(muted) = endpoint.muted {
        write_text_element(writer, "cie:muted", if muted { "true" } else { "false" })?;
    }
    if let Some(speaking) = endpoint.speaking {
        write_text_element(writer, "cie:speaking", if speaking { "true" } else { "false" })?;
    }
    write(writer, Event::End(BytesStart::new("endpoint").to_end()))
}

/// Incremental builder fed by the reader events
#[derive(Default)]
struct DocumentParser {
    stack: Vec<String>,
    document: Option<ConferenceInfoDocument>,
    description: Option<ConferenceDescription>,
    available: Option<(Option<StreamType>, Option<MediaDirection>)>,
    user: Option<UserInfo>,
    endpoint: Option<EndpointInfo>,
    media: Option<(String, Option<StreamType>, Option<u32>, Option<MediaDirection>)>,
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ConferenceError::event_package(err.to_string()))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| ConferenceError::event_package(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_address(e: &BytesStart<'_>, name: &[u8]) -> Result<SipAddress> {
    let value = attribute(e, name)?.ok_or_else(|| {
        ConferenceError::event_package(format!(
            "missing {} attribute on <{}>",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(e.local_name().as_ref())
        ))
    })?;
    SipAddress::parse(&value)
}

fn element_state(e: &BytesStart<'_>) -> Result<ElementState> {
    match attribute(e, b"state")? {
        Some(value) => ElementState::parse(&value)
            .ok_or_else(|| ConferenceError::event_package(format!("invalid state: {}", value))),
        None => Ok(ElementState::Full),
    }
}

fn parse_bool(text: &str) -> Result<bool> {
    match text {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConferenceError::event_package(format!("invalid boolean: {}", other))),
    }
}

impl DocumentParser {
    fn parent(&self) -> Option<&str> {
        self.stack.len().checked_sub(2).map(|i| self.stack[i].as_str())
    }

    fn start(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        self.stack.push(name.clone());
        let parent = self.parent().map(str::to_owned);

        match (name.as_str(), parent.as_deref()) {
            ("conference-info", None) => {
                let entity = required_address(e, b"entity")?;
                let version = attribute(e, b"version")?
                    .map(|v| {
                        v.parse::<u32>()
                            .map_err(|_| ConferenceError::event_package(format!("invalid version: {}", v)))
                    })
                    .transpose()?
                    .unwrap_or(0);
                self.document = Some(ConferenceInfoDocument::new(entity, element_state(e)?, version));
            }
            ("conference-description", Some("conference-info")) => {
                self.description = Some(ConferenceDescription::default());
            }
            ("entry", Some("available-media")) => {
                self.available = Some((None, None));
            }
            ("user", Some("users")) => {
                self.user = Some(UserInfo {
                    entity: required_address(e, b"entity")?,
                    state: element_state(e)?,
                    display_text: None,
                    roles: None,
                    endpoints: Vec::new(),
                });
            }
            ("roles", Some("user")) => {
                if let Some(user) = self.user.as_mut() {
                    user.roles = Some(Vec::new());
                }
            }
            ("endpoint", Some("user")) => {
                self.endpoint = Some(EndpointInfo {
                    entity: required_address(e, b"entity")?,
                    state: element_state(e)?,
                    status: None,
                    media: Vec::new(),
                    muted: None,
                    speaking: None,
                });
            }
            ("media", Some("endpoint")) => {
                let id = attribute(e, b"id")?.unwrap_or_default();
                self.media = Some((id, None, None, None));
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<()> {
        let current = self.stack.last().cloned();
        let parent = self.parent().map(str::to_owned);
        let token = text.trim();

        match (current.as_deref(), parent.as_deref()) {
            (Some("subject"), Some("conference-description")) => {
                if let Some(description) = self.description.as_mut() {
                    description.subject = Some(text.to_string());
                }
            }
            (Some("type"), Some("entry")) => {
                if let Some(available) = self.available.as_mut() {
                    available.0 = StreamType::parse(token);
                }
            }
            (Some("status"), Some("entry")) => {
                if let Some(available) = self.available.as_mut() {
                    available.1 = MediaDirection::parse(token);
                }
            }
            (Some("display-text"), Some("user")) => {
                if let Some(user) = self.user.as_mut() {
                    user.display_text = Some(text.to_string());
                }
            }
            (Some("entry"), Some("roles")) => {
                if let Some(roles) = self.user.as_mut().and_then(|u| u.roles.as_mut()) {
                    roles.push(text.to_string());
                }
            }
            (Some("status"), Some("endpoint")) => {
                if let Some(endpoint) = self.endpoint.as_mut() {
                    endpoint.status = DeviceState::from_status(token);
                }
            }
            (Some("muted"), Some("endpoint")) => {
                let value = parse_bool(token)?;
                if let Some(endpoint) = self.endpoint.as_mut() {
                    endpoint.muted = Some(value);
                }
            }
            (Some("speaking"), Some("endpoint")) => {
                let value = parse_bool(token)?;
                if let Some(endpoint) = self.endpoint.as_mut() {
                    endpoint.speaking = Some(value);
                }
            }
            (Some("type"), Some("media")) => {
                if let Some(media) = self.media.as_mut() {
                    media.1 = StreamType::parse(token);
                }
            }
            (Some("src-id"), Some("media")) => {
                let src_id = token
                    .parse::<u32>()
                    .map_err(|_| ConferenceError::event_package(format!("invalid src-id: {}", token)))?;
                if let Some(media) = self.media.as_mut() {
                    media.2 = Some(src_id);
                }
            }
            (Some("status"), Some("media")) => {
                if let Some(media) = self.media.as_mut() {
                    media.3 = MediaDirection::parse(token);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &[u8]) -> Result<()> {
        let parent = self.parent().map(str::to_owned);
        match (name, parent.as_deref()) {
            (b"conference-description", _) => {
                if let (Some(document), Some(description)) = (self.document.as_mut(), self.description.take()) {
                    document.description = Some(description);
                }
            }
            (b"entry", Some("available-media")) => {
                if let (Some(description), Some((Some(media_type), status))) =
                    (self.description.as_mut(), self.available.take())
                {
                    description.available_media.push(AvailableMedia {
                        media_type,
                        status: status.unwrap_or(MediaDirection::Inactive),
                    });
                }
            }
            (b"media", Some("endpoint")) => {
                if let (Some(endpoint), Some((id, Some(media_type), src_id, status))) =
                    (self.endpoint.as_mut(), self.media.take())
                {
                    endpoint.media.push(EndpointMedia {
                        id,
                        media_type,
                        src_id,
                        status: status.unwrap_or(MediaDirection::Inactive),
                    });
                }
            }
            (b"endpoint", Some("user")) => {
                if let (Some(user), Some(endpoint)) = (self.user.as_mut(), self.endpoint.take()) {
                    user.endpoints.push(endpoint);
                }
            }
            (b"user", Some("users")) => {
                if let (Some(document), Some(user)) = (self.document.as_mut(), self.user.take()) {
                    document.users.push(user);
                }
            }
            _ => {}
        }
        self.stack.pop();
        Ok(())
    }

    fn finish(self) -> Result<ConferenceInfoDocument> {
        self.document
            .ok_or_else(|| ConferenceError::event_package("missing conference-info element"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ConferenceInfoDocument {
        let conference = SipAddress::parse("sip:focus@example.org;conf-id=a1b2").unwrap();
        let mut document = ConferenceInfoDocument::new(conference, ElementState::Full, 4);
        document.description = Some(ConferenceDescription {
            subject: Some("Design <review> & \"lunch\"".to_string()),
            available_media: vec![
                AvailableMedia {
                    media_type: StreamType::Audio,
                    status: MediaDirection::SendRecv,
                },
                AvailableMedia {
                    media_type: StreamType::Video,
                    status: MediaDirection::Inactive,
                },
            ],
        });
        document.users.push(UserInfo {
            entity: SipAddress::parse("sip:pauline@example.org").unwrap(),
            state: ElementState::Full,
            display_text: Some("Pauline".to_string()),
            roles: Some(vec!["admin".to_string(), "speaker".to_string()]),
            endpoints: vec![EndpointInfo {
                entity: SipAddress::parse("sip:pauline@example.org;gr=1234abcd").unwrap(),
                state: ElementState::Full,
                status: Some(DeviceState::OnHold),
                media: vec![EndpointMedia {
                    id: "1".to_string(),
                    media_type: StreamType::Audio,
                    src_id: Some(4242),
                    status: MediaDirection::SendRecv,
                }],
                muted: Some(true),
                speaking: Some(false),
            }],
        });
        document.users.push(UserInfo::deleted(SipAddress::parse("sip:laure@example.org").unwrap()));
        document
    }

    #[test]
    fn test_document_survives_xml() {
        let document = sample();
        let xml = document.to_xml().unwrap();
        assert!(xml.contains("conference-info"));
        assert!(xml.contains("state=\"deleted\""));
        assert_eq!(ConferenceInfoDocument::from_xml(&xml).unwrap(), document);
    }

    #[test]
    fn test_partial_user_without_roles() {
        let conference = SipAddress::parse("sip:marie@example.org;conf-id=77").unwrap();
        let mut document = ConferenceInfoDocument::new(conference, ElementState::Partial, 9);
        document.users.push(UserInfo {
            entity: SipAddress::parse("sip:laure@example.org").unwrap(),
            state: ElementState::Partial,
            display_text: None,
            roles: None,
            endpoints: vec![EndpointInfo::deleted(
                SipAddress::parse("sip:laure@example.org;gr=ff").unwrap(),
            )],
        });

        let parsed = ConferenceInfoDocument::from_xml(&document.to_xml().unwrap()).unwrap();
        assert!(!parsed.is_full_state());
        assert_eq!(parsed.version, 9);
        assert_eq!(parsed.users[0].roles, None);
        assert_eq!(parsed.users[0].endpoints[0].state, ElementState::Deleted);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ConferenceInfoDocument::from_xml("<users/>").is_err());
        assert!(ConferenceInfoDocument::from_xml("<conference-info state=\"full\"/>").is_err());
        let bad_version = "<conference-info entity=\"sip:a@b\" version=\"x\"/>";
        assert!(ConferenceInfoDocument::from_xml(bad_version).is_err());
    }

    #[test]
    fn test_text_fields_are_kept_verbatim() {
        let values = ["", " ", "  padded  ", "a < b && c > d", "\"double\" and 'single'", "line\nbreak", "tab\t"];
        for value in values {
            let mut document = sample();
            if let Some(description) = document.description.as_mut() {
                description.subject = Some(value.to_string());
            }
            document.users[0].display_text = Some(value.to_string());
            document.users[0].roles = Some(vec![value.to_string()]);

            let parsed = ConferenceInfoDocument::from_xml(&document.to_xml().unwrap()).unwrap();
            assert_eq!(parsed, document, "value {:?}", value);
        }
    }

    #[test]
    fn test_empty_and_cdata_subjects() {
        let empty = "<conference-info entity=\"sip:focus@example.org\" version=\"2\">\
                     <conference-description><subject/></conference-description></conference-info>";
        let parsed = ConferenceInfoDocument::from_xml(empty).unwrap();
        assert_eq!(parsed.description.unwrap().subject.as_deref(), Some(""));

        let cdata = "<conference-info entity=\"sip:focus@example.org\" version=\"3\">\
                     <conference-description><subject><![CDATA[ <raw> ]]></subject></conference-description>\
                     </conference-info>";
        let parsed = ConferenceInfoDocument::from_xml(cdata).unwrap();
        assert_eq!(parsed.description.unwrap().subject.as_deref(), Some(" <raw> "));
    }

    #[test]
    fn test_tokens_tolerate_surrounding_whitespace() {
        let xml = "<conference-info entity=\"sip:focus@example.org\" version=\"1\">
              <users>
                <user entity=\"sip:laure@example.org\">
                  <endpoint entity=\"sip:laure@example.org;gr=1\">
                    <status> connected </status>
                    <media id=\"1\"><type> audio </type><src-id> 17 </src-id><status> sendrecv </status></media>
                    <cie:muted> true </cie:muted>
                  </endpoint>
                </user>
              </users>
            </conference-info>";
        let parsed = ConferenceInfoDocument::from_xml(xml).unwrap();
        let endpoint = &parsed.users[0].endpoints[0];
        assert_eq!(endpoint.status, Some(DeviceState::Present));
        assert_eq!(endpoint.src_id(StreamType::Audio), Some(17));
        assert_eq!(endpoint.direction(StreamType::Audio), Some(MediaDirection::SendRecv));
        assert_eq!(endpoint.muted, Some(true));
    }
}

use std::str::FromStr;

use jid::Jid;

use super::{jid_attr, ns, Element, StanzaError};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// `get` and `set` expect exactly one reply.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

impl FromStr for IqType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(Error::StanzaDecode(format!("unknown iq type '{other}'"))),
        }
    }
}

/// An `<iq/>` request or response. The id correlates the two.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: IqType,
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
}

impl Iq {
    fn request(kind: IqType, id: impl Into<String>, payload: Element) -> Self {
        Iq {
            id: id.into(),
            from: None,
            to: None,
            kind,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn get(id: impl Into<String>, payload: Element) -> Self {
        Iq::request(IqType::Get, id, payload)
    }

    pub fn set(id: impl Into<String>, payload: Element) -> Self {
        Iq::request(IqType::Set, id, payload)
    }

    pub fn with_to(mut self, to: Option<Jid>) -> Self {
        self.to = to;
        self
    }

    /// An empty `result` answering `request`, addressed back to its sender.
    pub fn result_for(request: &Iq) -> Self {
        Iq {
            id: request.id.clone(),
            from: None,
            to: request.from.clone(),
            kind: IqType::Result,
            payload: None,
            error: None,
        }
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Payload namespace, used to route inbound requests.
    pub fn payload_ns(&self) -> Option<String> {
        self.payload.as_ref().map(|p| p.ns().to_string())
    }

    pub fn to_element(&self) -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("id", self.id.clone())
            .attr("from", self.from.as_ref().map(|j| j.to_string()))
            .attr("to", self.to.as_ref().map(|j| j.to_string()))
            .attr("type", self.kind.as_str())
            .append_all(self.payload.clone())
            .append_all(self.error.as_ref().map(StanzaError::to_element))
            .build()
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        if el.name() != "iq" {
            return Err(Error::StanzaDecode(format!(
                "expected <iq/>, got <{}/>",
                el.name()
            )));
        }
        let id = el
            .attr("id")
            .ok_or_else(|| Error::StanzaDecode("iq without id".to_string()))?
            .to_string();
        let kind: IqType = el
            .attr("type")
            .ok_or_else(|| Error::StanzaDecode("iq without type".to_string()))?
            .parse()?;

        let error = el
            .get_child("error", ns::CLIENT)
            .map(StanzaError::from_element);
        let payload = el
            .children()
            .find(|child| !child.is("error", ns::CLIENT))
            .cloned();

        Ok(Iq {
            id,
            from: jid_attr(el, "from")?,
            to: jid_attr(el, "to")?,
            kind,
            payload,
            error,
        })
    }
}

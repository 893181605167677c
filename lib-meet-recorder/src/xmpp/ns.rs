/// RFC 6120 client stanza namespace.
pub(crate) const CLIENT: &str = "jabber:client";

/// Jitsi Meet media presence extension (direction and SSRC per media type).
pub(crate) const JITSI_MEDIA: &str = "http://estos.de/ns/mjs";

/// RFC 6120 stanza error conditions.
pub(crate) const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

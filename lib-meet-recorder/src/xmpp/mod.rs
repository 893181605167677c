pub mod media;
pub(crate) mod ns;

use xmpp_parsers::Element;

/// Returns the defined condition of an `<error/>` child, e.g. `conflict` or `not-authorized`.
pub(crate) fn stanza_error_condition(element: &Element) -> Option<(String, Option<String>)> {
  let error = element.get_child("error", ns::CLIENT)?;
  let condition = error
    .children()
    .find(|child| child.ns() == ns::STANZAS && child.name() != "text")?
    .name()
    .to_owned();
  let text = error
    .get_child("text", ns::STANZAS)
    .map(|text| text.text());
  Some((condition, text))
}

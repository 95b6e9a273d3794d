use crate::CampaignContact;

/// Values available to `{placeholder}` tags in interaction step scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFields {
    pub first_name: String,
    pub last_name: String,
    pub cell: String,
    pub texter_first_name: String,
}

impl ScriptFields {
    #[must_use]
    pub fn for_contact(contact: &CampaignContact, texter_first_name: &str) -> Self {
        Self {
            first_name: contact.first_name.clone(),
            last_name: contact.last_name.clone(),
            cell: contact.cell.clone(),
            texter_first_name: texter_first_name.to_string(),
        }
    }

    fn lookup(&self, tag: &str) -> Option<&str> {
        match tag {
            "firstName" => Some(&self.first_name),
            "lastName" => Some(&self.last_name),
            "cell" => Some(&self.cell),
            "texterFirstName" => Some(&self.texter_first_name),
            _ => None,
        }
    }
}

/// Substitutes known `{tag}` placeholders; unknown tags and unbalanced
/// braces are kept verbatim.
#[must_use]
pub fn render_script(template: &str, fields: &ScriptFields) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find(['{', '}']) {
            Some(close) if after_open.as_bytes()[close] == b'}' => {
                let tag = &after_open[..close];
                match fields.lookup(tag) {
                    Some(value) => rendered.push_str(value),
                    None => {
                        rendered.push('{');
                        rendered.push_str(tag);
                        rendered.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            _ => {
                rendered.push('{');
                rest = after_open;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

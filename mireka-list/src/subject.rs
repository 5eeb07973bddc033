fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    haystack.get(from..)?.find(needle).map(|index| index + from)
}

/// Puts `prefix` at the front of `subject` and reduces any number of reply
/// markers after it to a single `RE:`.
///
/// `Re: [GAMES] Re: hello` with prefix `[GAMES]` becomes `[GAMES] RE: hello`.
#[must_use]
pub fn normalize_subject(subject: &str, prefix: &str) -> String {
    let mut subject = subject.to_string();
    let start = prefix.len();

    match subject.find(prefix) {
        Some(0) => {}
        found => {
            if let Some(index) = found {
                subject.replace_range(index..index + prefix.len(), "");
            }
            subject.insert_str(0, &format!("{prefix} "));
        }
    }

    while let Some(index) = find_from(&subject, "Re:", start) {
        subject.replace_range(index..index + 3, "RE:");
    }

    if let Some(first) = find_from(&subject, "RE:", start) {
        while let Some(index) = find_from(&subject, "RE:", first + 3) {
            subject.replace_range(index..index + 3, "");
        }
    }

    while let Some(index) = find_from(&subject, "  ", start) {
        subject.replace_range(index..index + 2, " ");
    }
    subject
}

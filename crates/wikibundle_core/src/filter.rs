/// Metric-safe label for a module name: statsd treats dots as separators.
pub fn metric_label(name: &str) -> String {
    name.replace('.', "_")
}

/// Strip comments and collapse whitespace in a CSS string. String literals
/// are preserved verbatim, including quotes inside `url(...)` values.
pub fn minify_css(css: &str) -> String {
    let stripped = strip_comments(css);
    let mut output = String::with_capacity(stripped.len());
    let mut chars = stripped.chars().peekable();
    let mut in_string: Option<char> = None;
    let mut pending_space = false;

    while let Some(ch) = chars.next() {
        if let Some(quote) = in_string {
            output.push(ch);
            if ch == '\\' {
                if let Some(next) = chars.next() {
                    output.push(next);
                }
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                flush_space(&mut output, &mut pending_space);
                in_string = Some(ch);
                output.push(ch);
            }
            c if c.is_whitespace() => {
                pending_space = !output.is_empty();
            }
            '{' | '}' | ';' | ':' | ',' | '>' => {
                // No space on either side of structural punctuation.
                pending_space = false;
                output.push(ch);
            }
            _ => {
                if pending_space && !ends_with_punctuation(&output) {
                    output.push(' ');
                }
                pending_space = false;
                output.push(ch);
            }
        }
    }
    output
}

fn flush_space(output: &mut String, pending_space: &mut bool) {
    if *pending_space && !ends_with_punctuation(output) {
        output.push(' ');
    }
    *pending_space = false;
}

fn ends_with_punctuation(output: &str) -> bool {
    matches!(
        output.chars().last(),
        None | Some('{') | Some('}') | Some(';') | Some(':') | Some(',') | Some('>')
    )
}

fn strip_comments(css: &str) -> String {
    let mut output = String::with_capacity(css.len());
    let mut chars = css.chars().peekable();
    let mut in_string: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(quote) = in_string {
            output.push(ch);
            if ch == '\\' {
                if let Some(next) = chars.next() {
                    output.push(next);
                }
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        if ch == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut previous = '\0';
            for inner in chars.by_ref() {
                if previous == '*' && inner == '/' {
                    break;
                }
                previous = inner;
            }
            continue;
        }
        if ch == '"' || ch == '\'' {
            in_string = Some(ch);
        }
        output.push(ch);
    }
    output
}

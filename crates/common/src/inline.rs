//! Inline data-node expression expansion.
//!
//! Table rules may describe their physical nodes compactly, e.g.
//! `ds_${0..1}.t_order_${0..3}` or `ds_${[east,west]}.t_user`. Every
//! `${..}` placeholder multiplies out cartesian-style, in placeholder order.

use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};

/// Expands one inline expression into the concrete strings it denotes.
///
/// Supported placeholder forms:
/// - `${low..high}` — inclusive integer range
/// - `${[a,b,c]}` — explicit list
pub fn expand(expression: &str) -> Result<Vec<String>> {
    let mut results = vec![String::new()];
    let mut rest = expression;

    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        let end = tail
            .find('}')
            .ok_or_else(|| malformed(expression, "unterminated '${'"))?;
        let placeholder = &tail[2..end];
        rest = &tail[end + 1..];

        let choices = expand_placeholder(expression, placeholder)?;
        let mut next = Vec::with_capacity(results.len() * choices.len());
        for prefix in &results {
            for choice in &choices {
                next.push(format!("{}{}{}", prefix, head, choice));
            }
        }
        results = next;
    }

    for result in &mut results {
        result.push_str(rest);
    }
    Ok(results)
}

fn expand_placeholder(expression: &str, placeholder: &str) -> Result<Vec<String>> {
    if let Some(list) = placeholder
        .strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
    {
        let items: Vec<String> = list
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        if items.is_empty() {
            return Err(malformed(expression, "empty list placeholder"));
        }
        return Ok(items);
    }

    if let Some((low, high)) = placeholder.split_once("..") {
        let low: i64 = low
            .trim()
            .parse()
            .map_err(|_| malformed(expression, "range bound is not an integer"))?;
        let high: i64 = high
            .trim()
            .parse()
            .map_err(|_| malformed(expression, "range bound is not an integer"))?;
        if low > high {
            return Err(malformed(expression, "range low bound exceeds high bound"));
        }
        return Ok((low..=high).map(|i| i.to_string()).collect());
    }

    Err(malformed(expression, "expected '${low..high}' or '${[a,b]}'"))
}

fn malformed(expression: &str, reason: &str) -> QuiltError {
    QuiltError::new(
        ErrorCode::InvalidDataNode,
        format!("Malformed inline expression '{}': {}", expression, reason),
    )
    .with_context(ErrorContext::DataNode {
        expression: expression.to_string(),
        datasource: None,
    })
}

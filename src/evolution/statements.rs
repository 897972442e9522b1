//! Splitting a script body into statements
//!
//! Statements end at `;`. A doubled `;;` stands for a literal `;` inside a
//! statement (function bodies, string literals). Blank statements are dropped.

pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ';' {
            current.push(c);
            continue;
        }
        if chars.peek() == Some(&';') {
            chars.next();
            current.push(';');
            continue;
        }
        push_statement(&mut statements, &current);
        current.clear();
    }
    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, statement: &str) {
    let trimmed = statement.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

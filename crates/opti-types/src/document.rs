//! Executable operation documents.
//!
//! A [`Document`] holds exactly one parsed operation. The parser covers the
//! subset of GraphQL a client data layer needs to route, normalize and split
//! operations: fields, aliases, arguments, directives and nested selections.
//! Fragments are rejected; operations reaching this layer are expected to be
//! pre-validated and fragment-free.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DocumentError;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::operation::Variables;

/// Directive marking a field as resolved from client-local state.
pub const CLIENT_DIRECTIVE: &str = "client";

/// Field injected into every nested selection so results can be normalized.
pub const TYPENAME_FIELD: &str = "__typename";

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// The three kinds of executable operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

// ---------------------------------------------------------------------------
// DocumentId
// ---------------------------------------------------------------------------

/// Identity of a document: the BLAKE3 hash of its source text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId([u8; 32]);

impl DocumentId {
    pub fn of_source(source: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"opti-document-v1:");
        hasher.update(source.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters.
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.short_id())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_id())
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// An argument or directive value as written in the document.
#[derive(Clone, Debug, PartialEq)]
pub enum InputValue {
    Variable(String),
    Int(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
    Enum(String),
    List(Vec<InputValue>),
    Object(Vec<(String, InputValue)>),
}

impl InputValue {
    /// Resolve to JSON, substituting variables. Absent variables resolve to `null`.
    pub fn resolve(&self, variables: &Variables) -> Value {
        match self {
            Self::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) | Self::Enum(s) => Value::String(s.clone()),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Null => Value::Null,
            Self::List(items) => Value::Array(items.iter().map(|v| v.resolve(variables)).collect()),
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(variables)))
                    .collect(),
            ),
        }
    }

    fn print(&self, out: &mut String) {
        match self {
            Self::Variable(name) => {
                out.push('$');
                out.push_str(name);
            }
            Self::Int(i) => out.push_str(&i.to_string()),
            Self::Float(f) => out.push_str(&f.to_string()),
            Self::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
            Self::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Null => out.push_str("null"),
            Self::Enum(e) => out.push_str(e),
            Self::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.print(out);
                }
                out.push(']');
            }
            Self::Object(entries) => {
                out.push('{');
                print_arguments_inner(entries, out);
                out.push('}');
            }
        }
    }
}

/// A directive applied to a field or operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: Vec<(String, InputValue)>,
}

/// A variable declared by the operation.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    /// The declared type, printed back verbatim (e.g. `[ID!]!`).
    pub type_ref: String,
    pub default_value: Option<InputValue>,
}

/// A field selection.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, InputValue)>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Field>,
}

impl Field {
    /// A bare leaf field, used when composing documents programmatically.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: Vec::new(),
        }
    }

    /// Key under which this field appears in a response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Key under which this field is stored in the normalized cache.
    ///
    /// Fields with arguments are keyed by name plus their resolved arguments
    /// as canonical JSON, so `todo(id: $id)` with `id = 7` stores under
    /// `todo({"id":7})`.
    pub fn storage_key(&self, variables: &Variables) -> String {
        if self.arguments.is_empty() {
            return self.name.clone();
        }
        format!("{}({})", self.name, self.arguments_json(variables))
    }

    /// Resolved arguments as a JSON object.
    pub fn resolved_arguments(&self, variables: &Variables) -> serde_json::Map<String, Value> {
        self.arguments
            .iter()
            .map(|(name, value)| (name.clone(), value.resolve(variables)))
            .collect()
    }

    fn arguments_json(&self, variables: &Variables) -> String {
        Value::Object(self.resolved_arguments(variables)).to_string()
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.iter().any(|d| d.name == name)
    }

    /// Whether the field is resolved from local state.
    pub fn is_local(&self) -> bool {
        self.has_directive(CLIENT_DIRECTIVE)
    }

    pub fn is_leaf(&self) -> bool {
        self.selection_set.is_empty()
    }

    fn print(&self, out: &mut String, indent: usize, add_typename: bool) {
        push_indent(out, indent);
        if let Some(alias) = &self.alias {
            out.push_str(alias);
            out.push_str(": ");
        }
        out.push_str(&self.name);
        if !self.arguments.is_empty() {
            out.push('(');
            print_arguments_inner(&self.arguments, out);
            out.push(')');
        }
        print_directives(&self.directives, out);
        if !self.selection_set.is_empty() {
            out.push(' ');
            print_selection(&self.selection_set, out, indent, add_typename, true);
        }
        out.push('\n');
    }
}

#[derive(Clone, Debug, PartialEq)]
struct OperationDefinition {
    kind: OperationKind,
    name: Option<String>,
    variable_definitions: Vec<VariableDefinition>,
    directives: Vec<Directive>,
    selection_set: Vec<Field>,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A parsed, immutable operation document.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    id: DocumentId,
    source: Arc<str>,
    definition: OperationDefinition,
}

impl Document {
    /// Parse a document containing exactly one operation.
    pub fn parse(source: &str) -> Result<Self, DocumentError> {
        let tokens = Lexer::new(source).tokenize()?;
        let definition = Parser::new(tokens).document()?;
        Ok(Self {
            id: DocumentId::of_source(source),
            source: Arc::from(source),
            definition,
        })
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> OperationKind {
        self.definition.kind
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.definition.name.as_deref()
    }

    pub fn variable_definitions(&self) -> &[VariableDefinition] {
        &self.definition.variable_definitions
    }

    /// Root selection set.
    pub fn selection_set(&self) -> &[Field] {
        &self.definition.selection_set
    }

    /// Fill in declared default values for variables the caller omitted.
    pub fn effective_variables(&self, variables: &Variables) -> Variables {
        let mut effective = variables.clone();
        for def in &self.definition.variable_definitions {
            if effective.contains_key(&def.name) {
                continue;
            }
            if let Some(default) = &def.default_value {
                effective.insert(def.name.clone(), default.resolve(variables));
            }
        }
        effective
    }

    pub fn has_local_fields(&self) -> bool {
        self.selection_set().iter().any(Field::is_local)
    }

    /// `true` when every root field is local-only.
    pub fn is_local_only(&self) -> bool {
        !self.selection_set().is_empty() && self.selection_set().iter().all(Field::is_local)
    }

    /// Root fields marked `@client`.
    pub fn local_fields(&self) -> impl Iterator<Item = &Field> {
        self.selection_set().iter().filter(|f| f.is_local())
    }

    /// The remote portion of this document, or `None` when nothing is remote.
    ///
    /// Variable definitions that the remaining selection no longer references
    /// are dropped so the server does not reject unused variables.
    pub fn without_local_fields(&self) -> Option<Document> {
        if !self.has_local_fields() {
            return Some(self.clone());
        }
        let remote: Vec<Field> = self
            .selection_set()
            .iter()
            .filter(|f| !f.is_local())
            .cloned()
            .collect();
        if remote.is_empty() {
            return None;
        }
        let mut used = Vec::new();
        collect_variables(&remote, &mut used);
        let variable_definitions = self
            .definition
            .variable_definitions
            .iter()
            .filter(|d| used.contains(&d.name))
            .cloned()
            .collect();
        let definition = OperationDefinition {
            kind: self.definition.kind,
            name: self.definition.name.clone(),
            variable_definitions,
            directives: self.definition.directives.clone(),
            selection_set: remote,
        };
        Some(Self::from_definition(definition))
    }

    /// Print the document as sent over the wire, with `__typename` added to
    /// every nested selection set.
    pub fn to_request_text(&self) -> String {
        self.print(true)
    }

    fn from_definition(definition: OperationDefinition) -> Self {
        let mut doc = Self {
            id: DocumentId::of_source(""),
            source: Arc::from(""),
            definition,
        };
        let printed = doc.print(false);
        doc.id = DocumentId::of_source(&printed);
        doc.source = Arc::from(printed.as_str());
        doc
    }

    fn print(&self, add_typename: bool) -> String {
        let def = &self.definition;
        let mut out = String::new();
        out.push_str(def.kind.keyword());
        if let Some(name) = &def.name {
            out.push(' ');
            out.push_str(name);
        }
        if !def.variable_definitions.is_empty() {
            out.push('(');
            for (i, var) in def.variable_definitions.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('$');
                out.push_str(&var.name);
                out.push_str(": ");
                out.push_str(&var.type_ref);
                if let Some(default) = &var.default_value {
                    out.push_str(" = ");
                    default.print(&mut out);
                }
            }
            out.push(')');
        }
        print_directives(&def.directives, &mut out);
        out.push(' ');
        print_selection(&def.selection_set, &mut out, 0, add_typename, false);
        out.push('\n');
        out
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print(false))
    }
}

fn collect_variables(fields: &[Field], out: &mut Vec<String>) {
    fn visit(value: &InputValue, out: &mut Vec<String>) {
        match value {
            InputValue::Variable(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            InputValue::List(items) => items.iter().for_each(|v| visit(v, out)),
            InputValue::Object(entries) => entries.iter().for_each(|(_, v)| visit(v, out)),
            _ => {}
        }
    }
    for field in fields {
        field.arguments.iter().for_each(|(_, v)| visit(v, out));
        for directive in &field.directives {
            directive.arguments.iter().for_each(|(_, v)| visit(v, out));
        }
        collect_variables(&field.selection_set, out);
    }
}

fn push_indent(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str("  ");
    }
}

fn print_arguments_inner(arguments: &[(String, InputValue)], out: &mut String) {
    for (i, (name, value)) in arguments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str(": ");
        value.print(out);
    }
}

fn print_directives(directives: &[Directive], out: &mut String) {
    for directive in directives {
        out.push_str(" @");
        out.push_str(&directive.name);
        if !directive.arguments.is_empty() {
            out.push('(');
            print_arguments_inner(&directive.arguments, out);
            out.push(')');
        }
    }
}

fn print_selection(
    fields: &[Field],
    out: &mut String,
    indent: usize,
    add_typename: bool,
    nested: bool,
) {
    out.push_str("{\n");
    for field in fields {
        field.print(out, indent + 1, add_typename);
    }
    let has_typename = fields
        .iter()
        .any(|f| f.name == TYPENAME_FIELD && f.alias.is_none());
    if add_typename && nested && !has_typename {
        push_indent(out, indent + 1);
        out.push_str(TYPENAME_FIELD);
        out.push('\n');
    }
    push_indent(out, indent);
    out.push('}');
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    fn document(&mut self) -> Result<OperationDefinition, DocumentError> {
        let definition = match self.peek_kind() {
            TokenKind::Eof => return Err(DocumentError::Empty),
            TokenKind::LBrace => OperationDefinition {
                kind: OperationKind::Query,
                name: None,
                variable_definitions: Vec::new(),
                directives: Vec::new(),
                selection_set: self.selection_set(0)?,
            },
            TokenKind::Name(keyword) => {
                let kind = match keyword.as_str() {
                    "query" => OperationKind::Query,
                    "mutation" => OperationKind::Mutation,
                    "subscription" => OperationKind::Subscription,
                    "fragment" => {
                        return Err(DocumentError::Unsupported("fragment definitions".into()))
                    }
                    _ => return Err(self.expected("operation keyword")),
                };
                self.advance();
                let name = match self.peek_kind() {
                    TokenKind::Name(_) => Some(self.name()?),
                    _ => None,
                };
                let variable_definitions = if self.check(&TokenKind::LParen) {
                    self.variable_definitions()?
                } else {
                    Vec::new()
                };
                let directives = self.directives()?;
                let selection_set = self.selection_set(0)?;
                OperationDefinition {
                    kind,
                    name,
                    variable_definitions,
                    directives,
                    selection_set,
                }
            }
            _ => return Err(self.expected("operation")),
        };
        if !self.check(&TokenKind::Eof) {
            return Err(DocumentError::Unsupported(
                "documents with more than one definition".into(),
            ));
        }
        Ok(definition)
    }

    fn variable_definitions(&mut self) -> Result<Vec<VariableDefinition>, DocumentError> {
        self.consume(&TokenKind::LParen, "'('")?;
        let mut defs = Vec::new();
        while !self.check(&TokenKind::RParen) {
            self.consume(&TokenKind::Dollar, "'$'")?;
            let name = self.name()?;
            self.consume(&TokenKind::Colon, "':'")?;
            let type_ref = self.type_ref()?;
            let default_value = if self.check(&TokenKind::Equals) {
                self.advance();
                Some(self.value()?)
            } else {
                None
            };
            defs.push(VariableDefinition {
                name,
                type_ref,
                default_value,
            });
        }
        self.consume(&TokenKind::RParen, "')'")?;
        Ok(defs)
    }

    fn type_ref(&mut self) -> Result<String, DocumentError> {
        let mut out = if self.check(&TokenKind::LBracket) {
            self.advance();
            let inner = self.type_ref()?;
            self.consume(&TokenKind::RBracket, "']'")?;
            format!("[{inner}]")
        } else {
            self.name()?
        };
        if self.check(&TokenKind::Bang) {
            self.advance();
            out.push('!');
        }
        Ok(out)
    }

    fn selection_set(&mut self, depth: usize) -> Result<Vec<Field>, DocumentError> {
        self.consume(&TokenKind::LBrace, "'{'")?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Spread) {
                return Err(DocumentError::Unsupported("fragment spreads".into()));
            }
            fields.push(self.field(depth)?);
        }
        self.consume(&TokenKind::RBrace, "'}'")?;
        if fields.is_empty() {
            return Err(self.expected("at least one field"));
        }
        Ok(fields)
    }

    fn field(&mut self, depth: usize) -> Result<Field, DocumentError> {
        let first = self.name()?;
        let (alias, name) = if self.check(&TokenKind::Colon) {
            self.advance();
            (Some(first), self.name()?)
        } else {
            (None, first)
        };
        let arguments = if self.check(&TokenKind::LParen) {
            self.arguments()?
        } else {
            Vec::new()
        };
        let directives = self.directives()?;
        if depth > 0 && directives.iter().any(|d| d.name == CLIENT_DIRECTIVE) {
            return Err(DocumentError::Unsupported(format!(
                "@{CLIENT_DIRECTIVE} on nested field '{name}'"
            )));
        }
        let selection_set = if self.check(&TokenKind::LBrace) {
            self.selection_set(depth + 1)?
        } else {
            Vec::new()
        };
        Ok(Field {
            alias,
            name,
            arguments,
            directives,
            selection_set,
        })
    }

    fn arguments(&mut self) -> Result<Vec<(String, InputValue)>, DocumentError> {
        self.consume(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let name = self.name()?;
            self.consume(&TokenKind::Colon, "':'")?;
            args.push((name, self.value()?));
        }
        self.consume(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn directives(&mut self) -> Result<Vec<Directive>, DocumentError> {
        let mut directives = Vec::new();
        while self.check(&TokenKind::At) {
            self.advance();
            let name = self.name()?;
            let arguments = if self.check(&TokenKind::LParen) {
                self.arguments()?
            } else {
                Vec::new()
            };
            directives.push(Directive { name, arguments });
        }
        Ok(directives)
    }

    fn value(&mut self) -> Result<InputValue, DocumentError> {
        let token = self.advance().ok_or(DocumentError::UnexpectedEof)?;
        let value = match token.kind {
            TokenKind::Dollar => InputValue::Variable(self.name()?),
            TokenKind::Int(i) => InputValue::Int(i),
            TokenKind::Float(f) => InputValue::Float(f),
            TokenKind::String(s) => InputValue::String(s),
            TokenKind::Name(n) => match n.as_str() {
                "true" => InputValue::Boolean(true),
                "false" => InputValue::Boolean(false),
                "null" => InputValue::Null,
                _ => InputValue::Enum(n),
            },
            TokenKind::LBracket => {
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.value()?);
                }
                self.consume(&TokenKind::RBracket, "']'")?;
                InputValue::List(items)
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = self.name()?;
                    self.consume(&TokenKind::Colon, "':'")?;
                    entries.push((key, self.value()?));
                }
                self.consume(&TokenKind::RBrace, "'}'")?;
                InputValue::Object(entries)
            }
            other => {
                return Err(DocumentError::Expected {
                    expected: "value".into(),
                    found: other.describe(),
                    line: token.line,
                    column: token.column,
                })
            }
        };
        Ok(value)
    }

    fn name(&mut self) -> Result<String, DocumentError> {
        match self.peek_kind() {
            TokenKind::Name(_) => match self.advance().map(|t| t.kind) {
                Some(TokenKind::Name(n)) => Ok(n),
                _ => Err(DocumentError::UnexpectedEof),
            },
            _ => Err(self.expected("name")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current)
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().map(|t| t.kind.clone()).unwrap_or(TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek().is_some_and(|t| &t.kind == kind)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.current).cloned();
        if token.as_ref().is_some_and(|t| t.kind != TokenKind::Eof) {
            self.current += 1;
        }
        token
    }

    fn consume(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, DocumentError> {
        if self.check(kind) {
            return self.advance().ok_or(DocumentError::UnexpectedEof);
        }
        Err(self.expected(expected))
    }

    fn expected(&self, expected: &str) -> DocumentError {
        match self.peek() {
            Some(token) if token.kind == TokenKind::Eof => DocumentError::UnexpectedEof,
            Some(token) => DocumentError::Expected {
                expected: expected.into(),
                found: token.kind.describe(),
                line: token.line,
                column: token.column,
            },
            None => DocumentError::UnexpectedEof,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIST_TODOS: &str = "query ListTodos { listTodos { id name } }";

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn parses_named_query() {
        let doc = Document::parse(LIST_TODOS).unwrap();
        assert_eq!(doc.kind(), OperationKind::Query);
        assert_eq!(doc.operation_name(), Some("ListTodos"));
        assert_eq!(doc.selection_set().len(), 1);
        let list = &doc.selection_set()[0];
        assert_eq!(list.name, "listTodos");
        assert_eq!(list.selection_set.len(), 2);
    }

    #[test]
    fn parses_anonymous_query() {
        let doc = Document::parse("{ viewer { id } }").unwrap();
        assert_eq!(doc.kind(), OperationKind::Query);
        assert!(doc.operation_name().is_none());
    }

    #[test]
    fn parses_mutation_with_variables() {
        let doc = Document::parse(
            "mutation AddTodo($input: TodoInput) { addTodo(input: $input) { id name } }",
        )
        .unwrap();
        assert_eq!(doc.kind(), OperationKind::Mutation);
        assert_eq!(doc.variable_definitions().len(), 1);
        assert_eq!(doc.variable_definitions()[0].type_ref, "TodoInput");
    }

    #[test]
    fn parses_subscription() {
        let doc = Document::parse("subscription { todoAdded { id name } }").unwrap();
        assert_eq!(doc.kind(), OperationKind::Subscription);
    }

    #[test]
    fn storage_key_substitutes_variables() {
        let doc = Document::parse("query GetTodo($id: ID!) { getTodo(id: $id) { id } }").unwrap();
        let field = &doc.selection_set()[0];
        assert_eq!(field.storage_key(&vars(json!({"id": 7}))), r#"getTodo({"id":7})"#);
        assert_eq!(field.response_key(), "getTodo");
    }

    #[test]
    fn alias_changes_response_key_not_storage_key() {
        let doc = Document::parse("{ first: todo(id: 1) { id } }").unwrap();
        let field = &doc.selection_set()[0];
        assert_eq!(field.response_key(), "first");
        assert_eq!(field.storage_key(&Variables::new()), r#"todo({"id":1})"#);
    }

    #[test]
    fn default_variables_are_applied() {
        let doc =
            Document::parse("query Page($first: Int = 10) { todos(first: $first) { id } }").unwrap();
        let effective = doc.effective_variables(&Variables::new());
        assert_eq!(effective.get("first"), Some(&json!(10)));
    }

    #[test]
    fn request_text_injects_typename_in_nested_sets_only() {
        let doc = Document::parse(LIST_TODOS).unwrap();
        let text = doc.to_request_text();
        assert!(text.contains("__typename"));
        // Re-parse to make sure the printed text is valid.
        let reparsed = Document::parse(&text).unwrap();
        let root = reparsed.selection_set();
        assert_eq!(root.len(), 1);
        assert!(root[0].selection_set.iter().any(|f| f.name == TYPENAME_FIELD));
    }

    #[test]
    fn local_fields_are_split_from_remote() {
        let doc = Document::parse(
            "query Mixed($id: ID!) { networkStatus @client { isConnected } getTodo(id: $id) { id } }",
        )
        .unwrap();
        assert!(doc.has_local_fields());
        assert!(!doc.is_local_only());
        let remote = doc.without_local_fields().unwrap();
        assert_eq!(remote.selection_set().len(), 1);
        assert_eq!(remote.selection_set()[0].name, "getTodo");
        assert_eq!(remote.variable_definitions().len(), 1);
        assert_ne!(remote.id(), doc.id());
    }

    #[test]
    fn local_only_document_has_no_remote_part() {
        let doc = Document::parse("query { networkStatus @client { isConnected } }").unwrap();
        assert!(doc.is_local_only());
        assert!(doc.without_local_fields().is_none());
    }

    #[test]
    fn unused_variables_are_dropped_from_remote_part() {
        let doc = Document::parse(
            "mutation M($c: Boolean) { updateNetworkStatus(isConnected: $c) @client other { id } }",
        )
        .unwrap();
        let remote = doc.without_local_fields().unwrap();
        assert!(remote.variable_definitions().is_empty());
    }

    #[test]
    fn nested_client_directive_is_rejected() {
        let err = Document::parse("{ todo { done @client } }").unwrap_err();
        assert!(matches!(err, DocumentError::Unsupported(_)));
    }

    #[test]
    fn fragments_are_rejected() {
        let err = Document::parse("{ todo { ...Parts } }").unwrap_err();
        assert!(matches!(err, DocumentError::Unsupported(_)));
    }

    #[test]
    fn empty_document_is_rejected() {
        assert_eq!(Document::parse("   ").unwrap_err(), DocumentError::Empty);
    }

    #[test]
    fn missing_brace_reports_eof() {
        assert_eq!(
            Document::parse("query { a ").unwrap_err(),
            DocumentError::UnexpectedEof
        );
    }

    #[test]
    fn same_source_same_id() {
        let a = Document::parse(LIST_TODOS).unwrap();
        let b = Document::parse(LIST_TODOS).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().short_id().len(), 8);
    }

    proptest::proptest! {
        #[test]
        fn storage_key_ignores_argument_order(a in -1000i64..1000, b in "[a-z]{1,8}") {
            let forward = Document::parse(&format!(r#"{{ f(x: {a}, y: "{b}") {{ id }} }}"#)).unwrap();
            let reverse = Document::parse(&format!(r#"{{ f(y: "{b}", x: {a}) {{ id }} }}"#)).unwrap();
            let vars = Variables::new();
            proptest::prop_assert_eq!(
                forward.selection_set()[0].storage_key(&vars),
                reverse.selection_set()[0].storage_key(&vars)
            );
        }
    }

    #[test]
    fn input_object_and_list_values_resolve() {
        let doc = Document::parse(
            r#"{ search(filter: {tags: ["a", $t], done: false, limit: 2.5, kind: OPEN}) { id } }"#,
        )
        .unwrap();
        let args = doc.selection_set()[0].resolved_arguments(&vars(json!({"t": "b"})));
        assert_eq!(
            Value::Object(args),
            json!({"filter": {"tags": ["a", "b"], "done": false, "limit": 2.5, "kind": "OPEN"}})
        );
    }
}

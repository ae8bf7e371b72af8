use std::fmt;

use log::{debug, warn};
use rustc_hash::FxHashMap;
use sqlparser::ast::{
    ColumnDef, ColumnOption, CreateIndex, CreateTable, DataType, Expr, Statement, TableConstraint,
};
use sqlparser::dialect::{GenericDialect, SQLiteDialect};
use sqlparser::parser::Parser;

use crate::btree::collect_records;
use crate::error::Error;
use crate::ident::take_identifier;
use crate::pager::{PageId, Pager};
use crate::record::Value;

/// Name of the built-in table that stores the schema on page 1.
pub const SCHEMA_TABLE: &str = "sqlite_schema";
const LEGACY_SCHEMA_TABLE: &str = "sqlite_master";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Table,
    Index,
    View,
    Trigger,
}

impl ObjectKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "table" => Some(Self::Table),
            "index" => Some(Self::Index),
            "view" => Some(Self::View),
            "trigger" => Some(Self::Trigger),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Index => "index",
            Self::View => "view",
            Self::Trigger => "trigger",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Declared type as written; empty when the column has none.
    pub decl_type: String,
}

/// One row of `sqlite_schema` with the column labels derived from its SQL.
#[derive(Clone, Debug)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub name: String,
    pub tbl_name: String,
    /// Views and triggers have no b-tree.
    pub root_page: Option<PageId>,
    pub sql: Option<String>,
    pub columns: Vec<Column>,
    /// The `INTEGER PRIMARY KEY` column. It is stored as NULL and its value
    /// is the rowid.
    pub rowid_alias: Option<usize>,
    pub without_rowid: bool,
}

impl SchemaObject {
    /// Build an object from its schema row, deriving columns from `sql`.
    pub fn new(
        kind: ObjectKind,
        name: impl Into<String>,
        tbl_name: impl Into<String>,
        root_page: Option<PageId>,
        sql: Option<String>,
    ) -> Self {
        let mut object = Self {
            kind,
            name: name.into(),
            tbl_name: tbl_name.into(),
            root_page,
            sql,
            columns: Vec::new(),
            rowid_alias: None,
            without_rowid: false,
        };

        let Some(sql) = object.sql.as_deref() else {
            return object;
        };
        match kind {
            ObjectKind::Table => {
                let schema = parse_table_schema(sql);
                object.columns = schema.columns;
                object.rowid_alias = schema.rowid_alias;
                object.without_rowid = schema.without_rowid;
            }
            ObjectKind::Index => {
                if let Some(names) = parse_index_columns(sql) {
                    object.columns = names
                        .into_iter()
                        .chain(std::iter::once("rowid".to_string()))
                        .map(|name| Column { name, decl_type: String::new() })
                        .collect();
                }
            }
            ObjectKind::View | ObjectKind::Trigger => {}
        }
        object
    }

    fn schema_table() -> Self {
        let column = |name: &str, decl_type: &str| Column {
            name: name.to_string(),
            decl_type: decl_type.to_string(),
        };
        Self {
            kind: ObjectKind::Table,
            name: SCHEMA_TABLE.to_string(),
            tbl_name: SCHEMA_TABLE.to_string(),
            root_page: Some(PageId::ROOT),
            sql: None,
            columns: vec![
                column("type", "text"),
                column("name", "text"),
                column("tbl_name", "text"),
                column("rootpage", "int"),
                column("sql", "text"),
            ],
            rowid_alias: None,
            without_rowid: false,
        }
    }

    pub fn is_table(&self) -> bool {
        self.kind == ObjectKind::Table
    }

    /// Whether this is the built-in schema table rather than a stored row.
    pub fn is_builtin(&self) -> bool {
        self.root_page == Some(PageId::ROOT) && self.name == SCHEMA_TABLE
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }
}

/// Number of stored schema objects of each kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub tables: usize,
    pub indexes: usize,
    pub views: usize,
    pub triggers: usize,
}

impl ObjectCounts {
    pub fn total(&self) -> usize {
        self.tables + self.indexes + self.views + self.triggers
    }
}

/// Every object described by `sqlite_schema`, in file order.
#[derive(Debug)]
pub struct SchemaCatalog {
    objects: Vec<SchemaObject>,
    by_name: FxHashMap<String, usize>,
    faults: Vec<Error>,
}

impl SchemaCatalog {
    /// Walk page 1 and decode each schema row.
    ///
    /// Never fails: unreadable branches and malformed rows are logged and kept
    /// as faults so the rest of the catalog stays usable.
    pub fn load(pager: &Pager) -> Self {
        let encoding = pager.header().encoding;
        let (rows, summary) = collect_records(pager, PageId::ROOT, encoding);

        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            match object_from_row(&row.record.values) {
                Some(object) => objects.push(object),
                None => warn!(
                    "skipping malformed schema row on page {} at offset {}",
                    row.page, row.offset
                ),
            }
        }
        debug!("schema holds {} objects", objects.len());

        let mut catalog = Self::from_objects(objects);
        catalog.faults = summary.faults;
        catalog
    }

    /// Build a catalog from already-known objects. The built-in schema table
    /// is always added first.
    pub fn from_objects(objects: impl IntoIterator<Item = SchemaObject>) -> Self {
        let mut catalog =
            Self { objects: Vec::new(), by_name: FxHashMap::default(), faults: Vec::new() };
        catalog.push(SchemaObject::schema_table());
        for object in objects {
            catalog.push(object);
        }
        catalog
    }

    fn push(&mut self, object: SchemaObject) {
        let idx = self.objects.len();
        self.by_name.entry(object.name.to_ascii_lowercase()).or_insert(idx);
        self.objects.push(object);
    }

    /// All objects in file order, starting with the built-in schema table.
    pub fn objects(&self) -> &[SchemaObject] {
        &self.objects
    }

    /// Look up an object by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&SchemaObject> {
        let key = name.to_ascii_lowercase();
        let key = if key == LEGACY_SCHEMA_TABLE { SCHEMA_TABLE.to_string() } else { key };
        self.by_name.get(&key).map(|&idx| &self.objects[idx])
    }

    pub fn tables(&self) -> impl Iterator<Item = &SchemaObject> {
        self.objects.iter().filter(|object| object.is_table())
    }

    /// Tables whose records carry exactly `count` columns.
    pub fn tables_with_column_count(&self, count: usize) -> impl Iterator<Item = &SchemaObject> {
        self.tables().filter(move |table| !table.columns.is_empty() && table.columns.len() == count)
    }

    /// Objects that own a b-tree.
    pub fn rooted(&self) -> impl Iterator<Item = (&SchemaObject, PageId)> {
        self.objects.iter().filter_map(|object| object.root_page.map(|root| (object, root)))
    }

    pub fn counts(&self) -> ObjectCounts {
        let mut counts = ObjectCounts::default();
        for object in self.objects.iter().filter(|object| !object.is_builtin()) {
            match object.kind {
                ObjectKind::Table => counts.tables += 1,
                ObjectKind::Index => counts.indexes += 1,
                ObjectKind::View => counts.views += 1,
                ObjectKind::Trigger => counts.triggers += 1,
            }
        }
        counts
    }

    /// Problems met while reading the schema b-tree.
    pub fn faults(&self) -> &[Error] {
        &self.faults
    }
}

fn object_from_row(values: &[Value]) -> Option<SchemaObject> {
    let text =
        |idx: usize| values.get(idx)?.as_text().map(|text| text.to_string_lossy().into_owned());

    let kind = ObjectKind::parse(&text(0)?)?;
    let name = text(1)?;
    let tbl_name = text(2).unwrap_or_else(|| name.clone());
    let root_page = values
        .get(3)
        .and_then(Value::as_integer)
        .and_then(|root| u32::try_from(root).ok())
        .and_then(PageId::try_new);
    let sql = text(4);

    Some(SchemaObject::new(kind, name, tbl_name, root_page, sql))
}

#[derive(Clone, Debug, Default)]
pub(crate) struct TableSchema {
    pub(crate) columns: Vec<Column>,
    pub(crate) rowid_alias: Option<usize>,
    pub(crate) without_rowid: bool,
}

/// Column labels for a `CREATE TABLE` statement. Falls back to a plain
/// tokenizer when `sqlparser` rejects the text.
pub(crate) fn parse_table_schema(sql: &str) -> TableSchema {
    match parse_create_table(sql) {
        Some(create) => table_schema_from_ast(&create),
        None => {
            debug!("sqlparser rejected table definition, tokenizing instead: {sql}");
            tokenize_table_schema(sql)
        }
    }
}

fn table_schema_from_ast(create: &CreateTable) -> TableSchema {
    let columns = create
        .columns
        .iter()
        .map(|column| Column {
            name: column.name.value.clone(),
            decl_type: column.data_type.to_string(),
        })
        .collect::<Vec<_>>();

    let mut rowid_alias = create.columns.iter().position(|column| {
        is_integer_type(column)
            && column
                .options
                .iter()
                .any(|option| {
                    matches!(option.option, ColumnOption::Unique { is_primary: true, .. })
                })
    });

    for constraint in &create.constraints {
        if let TableConstraint::PrimaryKey { columns: key, .. } = constraint {
            if let [ident] = key.as_slice() {
                rowid_alias = create.columns.iter().position(|column| {
                    is_integer_type(column) && column.name.value.eq_ignore_ascii_case(&ident.value)
                });
            }
        }
    }

    TableSchema {
        columns,
        rowid_alias: rowid_alias.filter(|_| !create.without_rowid),
        without_rowid: create.without_rowid,
    }
}

pub(crate) fn parse_index_columns(sql: &str) -> Option<Vec<String>> {
    let create = parse_create_index(sql)?;
    create
        .columns
        .iter()
        .map(|column| match &column.expr {
            Expr::Identifier(ident) => Some(ident.value.clone()),
            Expr::CompoundIdentifier(idents) => idents.last().map(|ident| ident.value.clone()),
            _ => None,
        })
        .collect()
}

fn parse_create_table(sql: &str) -> Option<CreateTable> {
    parse_statements(sql)?.into_iter().find_map(|statement| match statement {
        Statement::CreateTable(create) => Some(create),
        _ => None,
    })
}

fn parse_create_index(sql: &str) -> Option<CreateIndex> {
    parse_statements(sql)?.into_iter().find_map(|statement| match statement {
        Statement::CreateIndex(create) => Some(create),
        _ => None,
    })
}

fn parse_statements(sql: &str) -> Option<Vec<Statement>> {
    let sqlite = SQLiteDialect {};
    Parser::parse_sql(&sqlite, sql).ok().or_else(|| {
        let generic = GenericDialect {};
        Parser::parse_sql(&generic, sql).ok()
    })
}

fn is_integer_type(column: &ColumnDef) -> bool {
    matches!(column.data_type, DataType::Integer(_))
}

const CONSTRAINT_KEYWORDS: [&str; 5] = ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];
const TYPE_TERMINATORS: [&str; 11] = [
    "CONSTRAINT",
    "PRIMARY",
    "NOT",
    "NULL",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
    "AS",
];

/// Split the parenthesised body of a `CREATE TABLE` on top-level commas and
/// read a name and declared type from each column definition.
fn tokenize_table_schema(sql: &str) -> TableSchema {
    let Some((body, tail)) = parenthesised_body(sql) else {
        return TableSchema::default();
    };

    let mut schema = TableSchema::default();
    for definition in split_top_level(body) {
        let first_word = definition.split_whitespace().next().unwrap_or_default();
        if CONSTRAINT_KEYWORDS.iter().any(|kw| first_word.eq_ignore_ascii_case(kw)) {
            continue;
        }
        let Some((name, rest)) = take_identifier(definition) else {
            continue;
        };

        let words = rest.split_whitespace().collect::<Vec<_>>();
        let type_len = words
            .iter()
            .position(|word| TYPE_TERMINATORS.iter().any(|kw| word.eq_ignore_ascii_case(kw)))
            .unwrap_or(words.len());
        let decl_type = words[..type_len].join(" ");

        let upper = rest.to_ascii_uppercase();
        if decl_type.eq_ignore_ascii_case("INTEGER") && upper.contains("PRIMARY KEY") {
            schema.rowid_alias = Some(schema.columns.len());
        }
        schema.columns.push(Column { name, decl_type });
    }

    let tail = tail.to_ascii_uppercase();
    schema.without_rowid = tail.split_whitespace().collect::<Vec<_>>().windows(2).any(|pair| {
        pair[0] == "WITHOUT" && pair[1].trim_end_matches(';') == "ROWID"
    });
    if schema.without_rowid {
        schema.rowid_alias = None;
    }
    schema
}

/// The text between the first `(` and its matching `)`, and what follows it.
fn parenthesised_body(sql: &str) -> Option<(&str, &str)> {
    let start = sql.find('(')?;
    let mut depth = 0usize;
    let mut quote = None;
    for (idx, ch) in sql.char_indices().skip_while(|&(idx, _)| idx < start) {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'' | '`') => quote = Some(ch),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some((&sql[start + 1..idx], &sql[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (idx, ch) in body.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'' | '`') => quote = Some(ch),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(body[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(body[start..].trim());
    parts.retain(|part| !part.is_empty());
    parts
}

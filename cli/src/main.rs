//! caskctl: inspect and edit cask store files

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use cask_core::{
    BTreeDb, BuiltinComparator, CondOp, HashDb, IndexKind, IndexSpec, OpenMode, OrderType,
    QueryOp, TableDb,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod format;
mod store;

use store::{KeyValue, PutMode};

#[derive(Parser, Debug)]
#[command(name = "caskctl", version, about = "Inspect and edit cask store files")]
struct Cli {
    /// Open files without taking the advisory lock.
    #[arg(long, global = true)]
    no_lock: bool,

    #[command(subcommand)]
    store: StoreCommand,
}

#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Hash store file
    Hash {
        path: PathBuf,
        #[command(subcommand)]
        command: KvCommand,
    },
    /// Ordered (B+ tree) store file
    Btree {
        path: PathBuf,
        /// Key order for a new file; existing files keep their own.
        #[arg(long, value_enum)]
        cmp: Option<CmpArg>,
        #[command(subcommand)]
        command: KvCommand,
    },
    /// Table store file
    Table {
        path: PathBuf,
        #[command(subcommand)]
        command: TableCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KvCommand {
    /// Store a value
    Put {
        key: String,
        value: String,
        #[arg(long, value_enum, default_value_t = PutMode::Over)]
        mode: PutMode,
    },
    /// Print the value of a key
    Get {
        key: String,
        /// Print every duplicate value.
        #[arg(long)]
        all: bool,
    },
    /// Remove a key
    Out {
        key: String,
        /// Remove every duplicate value.
        #[arg(long)]
        all: bool,
    },
    /// List keys
    List {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        max: Option<usize>,
        /// Print values next to keys.
        #[arg(long)]
        values: bool,
    },
    /// Print file information
    Inform,
}

#[derive(Subcommand, Debug)]
enum TableCommand {
    /// Store a record given as `name=value` columns
    Put {
        pk: String,
        columns: Vec<String>,
        #[arg(long, value_enum, default_value_t = PutMode::Over)]
        mode: PutMode,
    },
    /// Print a record
    Get {
        pk: String,
        #[arg(long)]
        json: bool,
    },
    /// Remove a record
    Out { pk: String },
    /// List primary keys
    List {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Print file and index information
    Inform,
    /// Run a query
    Search {
        /// Condition as `column:OP:operand`; an empty column is the
        /// primary key and a leading `!` on OP negates it.
        #[arg(short = 'c', long = "cond")]
        conditions: Vec<String>,
        /// Column to order by.
        #[arg(long)]
        order: Option<String>,
        #[arg(long, value_enum, default_value_t = OrderArg::StrAsc)]
        order_type: OrderArg,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        /// Evaluate every condition by scanning.
        #[arg(long)]
        no_index: bool,
        /// Print the query plan instead of results.
        #[arg(long)]
        plan: bool,
        /// Print only the number of matches.
        #[arg(long)]
        count: bool,
        /// Remove the matching records.
        #[arg(long)]
        remove: bool,
        #[arg(long)]
        json: bool,
    },
    /// Create, rebuild or remove a column index
    Setindex {
        column: String,
        #[arg(value_enum)]
        kind: IndexArg,
        /// Fail if the index already exists.
        #[arg(long)]
        keep: bool,
        /// Build on first query instead of now.
        #[arg(long)]
        deferred: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CmpArg {
    Lexical,
    Decimal,
    Int32,
    Int64,
}

impl From<CmpArg> for BuiltinComparator {
    fn from(arg: CmpArg) -> Self {
        match arg {
            CmpArg::Lexical => Self::Lexical,
            CmpArg::Decimal => Self::Decimal,
            CmpArg::Int32 => Self::Int32,
            CmpArg::Int64 => Self::Int64,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OrderArg {
    StrAsc,
    StrDesc,
    NumAsc,
    NumDesc,
}

impl From<OrderArg> for OrderType {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::StrAsc => Self::StrAsc,
            OrderArg::StrDesc => Self::StrDesc,
            OrderArg::NumAsc => Self::NumAsc,
            OrderArg::NumDesc => Self::NumDesc,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum IndexArg {
    Lexical,
    Decimal,
    Token,
    Qgram,
    /// Rebuild an existing index.
    Optimize,
    /// Remove an existing index.
    Void,
}

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("cask_core=debug,caskctl=debug")
    } else {
        EnvFilter::new("cask_core=warn")
    }
}

fn main() -> anyhow::Result<()> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    Registry::default()
        .with(get_env_filter())
        .with(stderr_layer)
        .init();

    let cli = Cli::parse();
    let lock = if cli.no_lock {
        OpenMode::NO_LOCK
    } else {
        OpenMode::empty()
    };

    match cli.store {
        StoreCommand::Hash { path, command } => {
            let db = HashDb::new();
            db.open(&path, open_mode(command.writes(), lock))
                .with_context(|| format!("opening {}", path.display()))?;
            run_kv(&db, command)?;
            db.close()?;
        }
        StoreCommand::Btree { path, cmp, command } => {
            let db = BTreeDb::new();
            if let Some(cmp) = cmp {
                db.setcmpfunc(BuiltinComparator::from(cmp).shared())?;
            }
            db.open(&path, open_mode(command.writes(), lock))
                .with_context(|| format!("opening {}", path.display()))?;
            run_kv(&db, command)?;
            db.close()?;
        }
        StoreCommand::Table { path, command } => {
            let db = TableDb::new();
            db.open(&path, open_mode(command.writes(), lock))
                .with_context(|| format!("opening {}", path.display()))?;
            run_table(&db, &path, command)?;
            db.close()?;
        }
    }
    Ok(())
}

fn open_mode(writes: bool, lock: OpenMode) -> OpenMode {
    let mode = if writes {
        OpenMode::WRITER | OpenMode::CREATE
    } else {
        OpenMode::READER
    };
    mode | lock
}

impl KvCommand {
    fn writes(&self) -> bool {
        matches!(self, Self::Put { .. } | Self::Out { .. })
    }
}

impl TableCommand {
    fn writes(&self) -> bool {
        match self {
            Self::Put { .. } | Self::Out { .. } | Self::Setindex { .. } => true,
            Self::Search { remove, .. } => *remove,
            _ => false,
        }
    }
}

fn run_kv(db: &dyn KeyValue, command: KvCommand) -> anyhow::Result<()> {
    match command {
        KvCommand::Put { key, value, mode } => {
            if db.store(key.as_bytes(), value.as_bytes(), mode)? {
                format::done(&format!("stored {key}"));
            } else {
                format::skipped(&format!("{key} already exists"));
            }
        }
        KvCommand::Get { key, all } => {
            let values = db.values(key.as_bytes(), all)?;
            if values.is_empty() {
                bail!("no record for {key}");
            }
            for value in values {
                println!("{}", String::from_utf8_lossy(&value));
            }
        }
        KvCommand::Out { key, all } => {
            db.remove(key.as_bytes(), all)?;
            format::done(&format!("removed {key}"));
        }
        KvCommand::List {
            prefix,
            max,
            values,
        } => {
            let prefix = prefix.unwrap_or_default();
            for key in db.prefix_keys(prefix.as_bytes(), max)? {
                if values {
                    let value = db.values(&key, false)?.into_iter().next().unwrap_or_default();
                    format::pair(&key, &value);
                } else {
                    println!("{}", String::from_utf8_lossy(&key));
                }
            }
        }
        KvCommand::Inform => format::inform(db.kind(), db.path(), db.rnum()?, db.fsiz()?),
    }
    Ok(())
}

fn run_table(db: &TableDb, path: &Path, command: TableCommand) -> anyhow::Result<()> {
    match command {
        TableCommand::Put { pk, columns, mode } => {
            let record = parse_columns(&columns)?;
            let stored = match mode {
                PutMode::Over => db.put(pk.as_bytes(), &record).map(|()| true)?,
                PutMode::Keep => db.putkeep(pk.as_bytes(), &record)?,
                PutMode::Cat => db.putcat(pk.as_bytes(), &record).map(|()| true)?,
                PutMode::Dup => bail!("tables hold one record per primary key"),
            };
            if stored {
                format::done(&format!("stored {pk}"));
            } else {
                format::skipped(&format!("{pk} already exists"));
            }
        }
        TableCommand::Get { pk, json } => {
            let record = db
                .get(pk.as_bytes())?
                .with_context(|| format!("no record for {pk}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&format::record_json(pk.as_bytes(), &record))?);
            } else {
                format::record(pk.as_bytes(), &record);
            }
        }
        TableCommand::Out { pk } => {
            db.out(pk.as_bytes())?;
            format::done(&format!("removed {pk}"));
        }
        TableCommand::List { prefix, max } => {
            let prefix = prefix.unwrap_or_default();
            for pk in db.fwmkeys(prefix.as_bytes(), max)? {
                println!("{}", String::from_utf8_lossy(&pk));
            }
        }
        TableCommand::Inform => {
            format::inform("table", Some(path.to_path_buf()), db.rnum()?, db.fsiz()?);
            format::indexes(&db.indexes()?);
        }
        TableCommand::Search {
            conditions,
            order,
            order_type,
            limit,
            skip,
            no_index,
            plan,
            count,
            remove,
            json,
        } => {
            let mut query = db.query()?;
            for raw in &conditions {
                let (column, op, operand) = parse_condition(raw, no_index)?;
                query.add_cond(column, op, operand)?;
            }
            if let Some(column) = &order {
                query.set_order(column, order_type.into());
            }
            query.set_limit(limit, skip);

            if plan {
                println!("{}", query.plan()?);
            } else if remove {
                let removed = query.search_out()?;
                format::done(&format!("removed {removed} records"));
            } else if count {
                println!("{}", query.count()?);
            } else {
                let keys = query.search()?;
                let mut rows = Vec::with_capacity(keys.len());
                for pk in keys {
                    let record = db.get(&pk)?.unwrap_or_default();
                    rows.push((pk, record));
                }
                if json {
                    let list: Vec<_> = rows
                        .iter()
                        .map(|(pk, record)| format::record_json(pk, record))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&list)?);
                } else {
                    for (pk, record) in &rows {
                        format::record(pk, record);
                    }
                    format::summary(rows.len());
                }
            }
        }
        TableCommand::Setindex {
            column,
            kind,
            keep,
            deferred,
        } => {
            let mut spec = match kind {
                IndexArg::Lexical => IndexSpec::new(IndexKind::Lexical),
                IndexArg::Decimal => IndexSpec::new(IndexKind::Decimal),
                IndexArg::Token => IndexSpec::new(IndexKind::Token),
                IndexArg::Qgram => IndexSpec::new(IndexKind::QGram),
                IndexArg::Optimize => IndexSpec::optimize(),
                IndexArg::Void => IndexSpec::void(),
            };
            if keep {
                spec = spec.keep();
            }
            if deferred {
                spec = spec.deferred();
            }
            db.setindex(&column, spec)?;
            format::done(&format!("index on {column} updated"));
        }
    }
    Ok(())
}

fn parse_columns(pairs: &[String]) -> anyhow::Result<cask_core::Columns> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .with_context(|| format!("column {pair:?} is not name=value"))
        })
        .collect()
}

/// Split `column:OP:operand`.
fn parse_condition(raw: &str, no_index: bool) -> anyhow::Result<(&str, CondOp, &str)> {
    let mut parts = raw.splitn(3, ':');
    let (Some(column), Some(name), Some(operand)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("condition {raw:?} is not column:OP:operand");
    };
    let (negated, name) = match name.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let mut op = CondOp::from(
        QueryOp::from_name(name).with_context(|| format!("unknown operator {name:?}"))?,
    );
    if negated {
        op = op.negate();
    }
    if no_index {
        op = op.no_index();
    }
    Ok((column, op, operand))
}

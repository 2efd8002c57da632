//! Pluginschema/Commandschema/Argumentschema repository (§3, §4.6, §6):
//! the registered command schemas used by the help system and by the
//! plugger to parse command-to-bot text (§4.2).

use sqlx::SqlitePool;

use mup_proto::command::{ArgKind, Argument, ArgShape, CommandSchema};

use super::DbError;

/// One row of `argumentschema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSchema {
    pub name: String,
    pub kind: String,
    pub required: bool,
    pub is_option: bool,
    pub trailing: bool,
    pub sort_order: i64,
}

impl ArgumentSchema {
    fn to_argument(&self) -> Argument {
        let shape = if self.is_option {
            ArgShape::Option {
                kind: match self.kind.as_str() {
                    "int" => ArgKind::Int,
                    "bool" => ArgKind::Bool,
                    _ => ArgKind::String,
                },
            }
        } else {
            ArgShape::Positional {
                trailing: self.trailing,
            }
        };
        Argument {
            name: self.name.clone(),
            shape,
            required: self.required,
        }
    }
}

/// One row of `commandschema`, with its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSchemaRecord {
    pub plugin: String,
    pub name: String,
    pub arguments: Vec<ArgumentSchema>,
}

impl CommandSchemaRecord {
    /// Build the live [`CommandSchema`] a plugger uses to parse command
    /// text against this registration (§4.2).
    pub fn to_schema(&self) -> CommandSchema {
        let mut schema = CommandSchema::new(&self.name);
        for arg in &self.arguments {
            schema = schema.arg(arg.to_argument());
        }
        schema
    }

    /// The inverse of [`Self::to_schema`]: capture a registry-declared
    /// schema as DB rows so the help system can introspect it without
    /// holding a reference to the live plugin registry (§3, §4.6).
    pub fn from_schema(plugin: &str, schema: &CommandSchema) -> Self {
        let arguments = schema
            .arguments()
            .iter()
            .enumerate()
            .map(|(idx, arg)| {
                let (kind, is_option, trailing) = match &arg.shape {
                    ArgShape::Positional { trailing } => ("string".to_owned(), false, *trailing),
                    ArgShape::Option { kind } => (kind.label().to_owned(), true, false),
                };
                ArgumentSchema {
                    name: arg.name.clone(),
                    kind,
                    required: arg.required,
                    is_option,
                    trailing,
                    sort_order: idx as i64,
                }
            })
            .collect();
        Self {
            plugin: plugin.to_owned(),
            name: schema.name.clone(),
            arguments,
        }
    }
}

/// Repository for `pluginschema` / `commandschema` / `argumentschema`.
pub struct SchemaRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SchemaRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// The `help` text registered for a plugin (§6: help-style plugins
    /// surface this).
    pub async fn plugin_help(&self, plugin: &str) -> Result<Option<String>, DbError> {
        let help = sqlx::query_scalar::<_, String>(
            "SELECT help FROM pluginschema WHERE name = ?",
        )
        .bind(plugin)
        .fetch_optional(self.pool)
        .await?;
        Ok(help)
    }

    /// Register (or replace) a plugin's help text and command schemas.
    /// Called once at plugin registration / startup, not on the hot path.
    pub async fn register_plugin(
        &self,
        plugin: &str,
        help: &str,
        commands: &[CommandSchemaRecord],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO pluginschema (name, help) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET help = excluded.help",
        )
        .bind(plugin)
        .bind(help)
        .execute(&mut *tx)
        .await?;

        for cmd in commands {
            let command_id: i64 = sqlx::query_scalar(
                "INSERT INTO commandschema (plugin, name) VALUES (?, ?)
                 ON CONFLICT(plugin, name) DO UPDATE SET name = excluded.name
                 RETURNING id",
            )
            .bind(plugin)
            .bind(&cmd.name)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM argumentschema WHERE command = ?")
                .bind(command_id)
                .execute(&mut *tx)
                .await?;

            for (idx, arg) in cmd.arguments.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO argumentschema (command, name, kind, required, is_option, trailing, sort_order)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(command_id)
                .bind(&arg.name)
                .bind(&arg.kind)
                .bind(arg.required)
                .bind(arg.is_option)
                .bind(arg.trailing)
                .bind(idx as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// All command schemas registered for `plugin`, arguments in
    /// declaration order.
    pub async fn commands_for_plugin(
        &self,
        plugin: &str,
    ) -> Result<Vec<CommandSchemaRecord>, DbError> {
        let commands: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, name FROM commandschema WHERE plugin = ? ORDER BY id",
        )
        .bind(plugin)
        .fetch_all(self.pool)
        .await?;

        let mut out = Vec::with_capacity(commands.len());
        for (id, name) in commands {
            let rows: Vec<(String, String, bool, bool, bool, i64)> = sqlx::query_as(
                "SELECT name, kind, required, is_option, trailing, sort_order
                 FROM argumentschema WHERE command = ? ORDER BY sort_order",
            )
            .bind(id)
            .fetch_all(self.pool)
            .await?;

            let arguments = rows
                .into_iter()
                .map(
                    |(name, kind, required, is_option, trailing, sort_order)| ArgumentSchema {
                        name,
                        kind,
                        required,
                        is_option,
                        trailing,
                        sort_order,
                    },
                )
                .collect();

            out.push(CommandSchemaRecord {
                plugin: plugin.to_owned(),
                name,
                arguments,
            });
        }
        Ok(out)
    }
}

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use mailbox_pipeline::{Config, db, init_logger};

#[derive(Debug, Clone)]
struct UserArg {
    id: i64,
    user_name: String,
    email_address: String,
}

fn parse_user(value: &str) -> Result<UserArg, String> {
    let mut parts = value.splitn(3, ':');
    let (Some(id), Some(user_name), Some(email_address)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected ID:NAME:EMAIL, got '{value}'"));
    };

    let id = id
        .trim()
        .parse::<i64>()
        .map_err(|err| format!("invalid user id '{id}': {err}"))?;
    if !email_address.contains('@') {
        return Err(format!("email '{email_address}' must contain '@'"));
    }

    Ok(UserArg {
        id,
        user_name: user_name.trim().to_string(),
        email_address: email_address.trim().to_lowercase(),
    })
}

#[derive(Parser, Debug)]
#[command(name = "add_mailbox", about = "Insert a mailbox and its users")]
struct Args {
    /// Mailbox id.
    #[arg(long)]
    id: i64,

    /// External MPI identifier of the mailbox.
    #[arg(long)]
    mpi_id: String,

    /// Access token stored with the mailbox.
    #[arg(long)]
    token: String,

    /// User to attach, as `ID:NAME:EMAIL`. Repeatable.
    #[arg(long = "user", value_parser = parse_user)]
    users: Vec<UserArg>,

    /// YAML configuration file. Environment and defaults are used when it is missing.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Apply schema migrations first.
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    let args = Args::parse();

    let config = Config::load(&args.config)?;
    config.validate()?;

    let pool = db::connect_with_config(&config.database).await?;
    if args.migrate {
        db::run_migrations(&pool).await?;
    }

    let mut tx = pool.begin().await?;

    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM mailboxes WHERE id = $1")
        .bind(args.id)
        .fetch_one(&mut *tx)
        .await?;

    if existing > 0 {
        writeln!(
            io::stderr(),
            "error: mailbox {} already exists.",
            args.id
        )?;
        std::process::exit(1);
    }

    let created_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    sqlx::query("INSERT INTO mailboxes (id, mpi_id, token, created_at) VALUES ($1, $2, $3, $4)")
        .bind(args.id)
        .bind(args.mpi_id.trim().to_string())
        .bind(args.token.clone())
        .bind(created_at.clone())
        .execute(&mut *tx)
        .await?;

    for user in &args.users {
        sqlx::query(
            "INSERT INTO users (id, mailbox_id, user_name, email_address, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(args.id)
        .bind(user.user_name.clone())
        .bind(user.email_address.clone())
        .bind(created_at.clone())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    println!(
        "Created mailbox {} ({}) with {} users",
        args.id,
        args.mpi_id.trim(),
        args.users.len()
    );
    Ok(())
}

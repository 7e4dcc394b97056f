use course_server::{
    admin, config::Config, db, enrollment,
    user::{self, NewUser, Role},
    utils::init_log,
};
use clap::Parser;

#[derive(Debug, clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Database URL; falls back to DATABASE_URL, then the built-in default
    #[arg(short, long)]
    database: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Create the database and apply pending migrations
    Migrate,
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Mark enrollments past their expiry date as expired
    ExpireEnrollments,
}

#[derive(Debug, clap::Subcommand)]
enum AdminCommand {
    List,
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(long = "super")]
        is_super_admin: bool,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum RoleArg {
    Student,
    Professor,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Student => Role::Student,
            RoleArg::Professor => Role::Professor,
        }
    }
}

#[derive(Debug, clap::Subcommand)]
enum UserCommand {
    List {
        #[arg(short, long)]
        role: Option<RoleArg>,
    },
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long, default_value = "student")]
        role: RoleArg,
    },
    SetRole {
        id: i64,
        role: RoleArg,
    },
    Verify {
        id: i64,
        /// Remove the verification instead
        #[arg(long)]
        revoke: bool,
    },
    Delete {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_log(None)?;
    run(Args::parse()).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let url = args
        .database
        .or_else(|| dotenvy::var("DATABASE_URL").ok())
        .unwrap_or_else(|| Config::default().database_url);
    let database = db::connect(&url).await?;

    match args.command {
        Commands::Migrate => println!("Database at {} is up to date", url),
        Commands::Admin { command } => match command {
            AdminCommand::List => {
                for a in admin::list_admins(&database).await? {
                    println!(
                        "{:<6} {:<32} super={:<5} active={}",
                        a.id, a.email, a.is_super_admin, a.is_active
                    );
                }
            }
            AdminCommand::Create {
                name,
                email,
                password,
                is_super_admin,
            } => {
                let id = admin::create_admin(&database, &name, &email, &password, is_super_admin)
                    .await?;
                println!("Admin created with id: {}", id);
            }
        },
        Commands::User { command } => match command {
            UserCommand::List { role } => {
                for u in user::list_users(&database, role.map(Role::from)).await? {
                    println!(
                        "{:<6} {:<32} {:<10} verified={}",
                        u.id,
                        u.email,
                        format!("{:?}", u.role),
                        u.is_verified
                    );
                }
            }
            UserCommand::Create {
                name,
                email,
                password,
                role,
            } => {
                let role = Role::from(role);
                let id = user::create_user(
                    &database,
                    NewUser {
                        name,
                        email,
                        password,
                        role,
                        is_verified: role == Role::Professor,
                    },
                )
                .await?;
                println!("User created with id: {}", id);
            }
            UserCommand::SetRole { id, role } => {
                user::set_role(&database, id, role.into()).await?;
                println!("Role of user {} changed to {:?}", id, role);
            }
            UserCommand::Verify { id, revoke } => {
                user::set_verified(&database, id, !revoke).await?;
                println!("User {} verified={}", id, !revoke);
            }
            UserCommand::Delete { id } => {
                user::delete_user(&database, id).await?;
                println!("User deleted with id: {}", id);
            }
        },
        Commands::ExpireEnrollments => {
            let expired = enrollment::expire_due(&database).await?;
            println!("{} enrollments expired", expired);
        }
    }
    Ok(())
}

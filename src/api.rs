use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use actix_web::{delete, get, patch, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LedgerError;
use crate::exchange::SettleUpSummary;
use crate::schemas::{NewExpense, User, UserId};
use crate::store::LedgerStore;
use crate::sync::SyncCoordinator;

/// One coordinator per signed-in user.
pub struct Sessions {
    store: Arc<dyn LedgerStore>,
    coordinators: RwLock<HashMap<UserId, Arc<SyncCoordinator>>>,
}

impl Sessions {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            coordinators: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, user_id: &str) -> Result<Arc<SyncCoordinator>, LedgerError> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .ok_or(LedgerError::NotSignedIn)
    }

    fn start(&self, user: User) {
        let coordinator = Arc::new(SyncCoordinator::new(self.store.clone()));
        coordinator.sign_in(user.clone());
        let previous = self
            .coordinators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id, coordinator);
        if let Some(previous) = previous {
            previous.sign_out();
        }
    }

    fn stop(&self, user_id: &str) -> bool {
        let removed = self
            .coordinators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
        match removed {
            Some(coordinator) => {
                coordinator.sign_out();
                true
            }
            None => false,
        }
    }
}

fn error_response(err: LedgerError) -> HttpResponse {
    if err.is_validation() {
        HttpResponse::BadRequest().body(err.to_string())
    } else if err.is_not_found() {
        HttpResponse::NotFound().body(err.to_string())
    } else if matches!(err, LedgerError::NotSignedIn) {
        HttpResponse::Unauthorized().body(err.to_string())
    } else {
        HttpResponse::InternalServerError().body(err.to_string())
    }
}

macro_rules! session {
    ($sessions:expr, $user_id:expr) => {
        match $sessions.get($user_id) {
            Ok(coordinator) => coordinator,
            Err(err) => return error_response(err),
        }
    };
}

#[derive(Deserialize)]
struct RegisterJson {
    id: UserId,
    email: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct SignInJson {
    user_id: UserId,
}

#[derive(Deserialize)]
struct FriendJson {
    email: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct GroupJson {
    name: String,
    #[serde(default)]
    member_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct MembersJson {
    member_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct SplitJson {
    split_between: Vec<UserId>,
}

#[derive(Deserialize)]
struct SettleJson {
    from_user_id: UserId,
    to_user_id: UserId,
    amount: f64,
}

#[derive(Serialize)]
struct SummaryJson {
    #[serde(flatten)]
    summary: SettleUpSummary,
    all_settled: bool,
}

#[derive(Serialize)]
struct IdentityJson {
    name: String,
    email: String,
}

#[post("/users")]
async fn register_user(sessions: web::Data<Sessions>, json: web::Json<RegisterJson>) -> HttpResponse {
    let json = json.into_inner();
    let email = json.email.trim().to_string();
    let name = json
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| email.split('@').next().unwrap_or(&email).to_string());
    let user = User {
        id: json.id,
        email,
        name,
    };
    match sessions.store.put_user(&user).await {
        Ok(()) => HttpResponse::Ok().json(user),
        Err(err) => error_response(err),
    }
}

#[post("/sessions")]
async fn sign_in(sessions: web::Data<Sessions>, json: web::Json<SignInJson>) -> HttpResponse {
    match sessions.store.fetch_user(&json.user_id).await {
        Ok(Some(user)) => {
            info!(user_id = %user.id, "Signed in");
            sessions.start(user.clone());
            HttpResponse::Ok().json(user)
        }
        Ok(None) => HttpResponse::NotFound().body("Couldn't find the desired user"),
        Err(err) => error_response(err),
    }
}

#[delete("/sessions/{user_id}")]
async fn sign_out(sessions: web::Data<Sessions>, user_id: web::Path<String>) -> HttpResponse {
    if sessions.stop(&user_id) {
        HttpResponse::Ok().body("Signed out")
    } else {
        error_response(LedgerError::NotSignedIn)
    }
}

#[get("/users/{user_id}/state")]
async fn get_state(sessions: web::Data<Sessions>, user_id: web::Path<String>) -> HttpResponse {
    let coordinator = session!(sessions, &user_id);
    HttpResponse::Ok().json(coordinator.snapshot())
}

#[post("/users/{user_id}/refresh")]
async fn refresh(sessions: web::Data<Sessions>, user_id: web::Path<String>) -> HttpResponse {
    let coordinator = session!(sessions, &user_id);
    coordinator.refresh_data().await;
    HttpResponse::Ok().json(coordinator.snapshot())
}

#[post("/users/{user_id}/friends")]
async fn add_friend(
    sessions: web::Data<Sessions>,
    user_id: web::Path<String>,
    json: web::Json<FriendJson>,
) -> HttpResponse {
    let coordinator = session!(sessions, &user_id);
    match coordinator.add_friend(&json.email, json.name.as_deref()).await {
        Ok(friend) => HttpResponse::Ok().json(friend),
        Err(err) => error_response(err),
    }
}

#[delete("/users/{user_id}/friends/{friend_id}")]
async fn delete_friend(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (user_id, friend_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator.delete_friend(&friend_id).await {
        Ok(()) => HttpResponse::Ok().body("Friend deleted"),
        Err(err) => error_response(err),
    }
}

#[post("/users/{user_id}/groups")]
async fn create_group(
    sessions: web::Data<Sessions>,
    user_id: web::Path<String>,
    json: web::Json<GroupJson>,
) -> HttpResponse {
    let coordinator = session!(sessions, &user_id);
    match coordinator.create_group(&json.name, &json.member_ids).await {
        Ok(group) => HttpResponse::Ok().json(group),
        Err(err) => error_response(err),
    }
}

#[post("/users/{user_id}/groups/{group_id}/members")]
async fn add_members(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
    json: web::Json<MembersJson>,
) -> HttpResponse {
    let (user_id, group_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator.add_member_to_group(&group_id, &json.member_ids).await {
        Ok(()) => HttpResponse::Ok().body("Members added"),
        Err(err) => error_response(err),
    }
}

#[delete("/users/{user_id}/groups/{group_id}")]
async fn delete_group(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (user_id, group_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator.delete_group(&group_id).await {
        Ok(()) => HttpResponse::Ok().body("Group deleted"),
        Err(err) => error_response(err),
    }
}

#[post("/users/{user_id}/groups/{group_id}/expenses")]
async fn add_expense(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
    expense: web::Json<NewExpense>,
) -> HttpResponse {
    let (user_id, group_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator.add_expense(&group_id, expense.into_inner()).await {
        Ok(expense) => HttpResponse::Ok().json(expense),
        Err(err) => error_response(err),
    }
}

#[patch("/users/{user_id}/groups/{group_id}/expenses/{expense_id}")]
async fn update_expense(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String, String)>,
    json: web::Json<SplitJson>,
) -> HttpResponse {
    let (user_id, group_id, expense_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator
        .update_expense_split(&group_id, &expense_id, json.into_inner().split_between)
        .await
    {
        Ok(()) => HttpResponse::Ok().body("Expense updated"),
        Err(err) => error_response(err),
    }
}

#[delete("/users/{user_id}/groups/{group_id}/expenses/{expense_id}")]
async fn delete_expense(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String, String)>,
) -> HttpResponse {
    let (user_id, group_id, expense_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator.delete_expense(&group_id, &expense_id).await {
        Ok(()) => HttpResponse::Ok().body("Expense deleted"),
        Err(err) => error_response(err),
    }
}

#[post("/users/{user_id}/groups/{group_id}/settlements")]
async fn settle_up(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
    json: web::Json<SettleJson>,
) -> HttpResponse {
    let (user_id, group_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator
        .settle_up(&group_id, &json.from_user_id, &json.to_user_id, json.amount)
        .await
    {
        Ok(settlement) => HttpResponse::Ok().json(settlement),
        Err(err) => error_response(err),
    }
}

#[get("/users/{user_id}/groups/{group_id}/balance")]
async fn get_balance(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (user_id, group_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    HttpResponse::Ok().json(coordinator.calculate_balances(&group_id))
}

#[get("/users/{user_id}/groups/{group_id}/pairwise/{user_a}/{user_b}")]
async fn get_pairwise_balance(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String, String, String)>,
) -> HttpResponse {
    let (user_id, group_id, user_a, user_b) = path.into_inner();
    if user_a == user_b {
        return HttpResponse::BadRequest().body("Pairwise balance needs two different users");
    }
    let coordinator = session!(sessions, &user_id);
    HttpResponse::Ok().json(coordinator.calculate_pairwise_balance(&group_id, &user_a, &user_b))
}

#[get("/users/{user_id}/groups/{group_id}/summary")]
async fn get_summary(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (user_id, group_id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    match coordinator.settle_up_summary(&group_id, &user_id) {
        Some(summary) => HttpResponse::Ok().json(SummaryJson {
            all_settled: summary.all_settled(),
            summary,
        }),
        None => error_response(LedgerError::GroupNotFound(group_id)),
    }
}

#[get("/users/{user_id}/totals")]
async fn get_totals(sessions: web::Data<Sessions>, user_id: web::Path<String>) -> HttpResponse {
    let coordinator = session!(sessions, &user_id);
    HttpResponse::Ok().json(coordinator.total_balance(&user_id))
}

#[get("/users/{user_id}/activity")]
async fn get_activity(sessions: web::Data<Sessions>, user_id: web::Path<String>) -> HttpResponse {
    let coordinator = session!(sessions, &user_id);
    HttpResponse::Ok().json(coordinator.recent_activity())
}

#[get("/users/{user_id}/names/{id}")]
async fn get_identity(
    sessions: web::Data<Sessions>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (user_id, id) = path.into_inner();
    let coordinator = session!(sessions, &user_id);
    HttpResponse::Ok().json(IdentityJson {
        name: coordinator.user_name(&id),
        email: coordinator.user_email(&id),
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(register_user)
        .service(sign_in)
        .service(sign_out)
        .service(get_state)
        .service(refresh)
        .service(add_friend)
        .service(delete_friend)
        .service(create_group)
        .service(add_members)
        .service(delete_group)
        .service(add_expense)
        .service(update_expense)
        .service(delete_expense)
        .service(settle_up)
        .service(get_balance)
        .service(get_pairwise_balance)
        .service(get_summary)
        .service(get_totals)
        .service(get_activity)
        .service(get_identity);
}

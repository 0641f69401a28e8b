use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::http::StatusCode;
use actix_web::{
    FromRequest, HttpRequest, HttpResponse, Responder, ResponseError, get, patch, post, put, web,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::SystemClock;
use crate::app::services::{
    DirectoryCommandHandler, DirectoryQueryHandler, ServiceError, SqliteRentalService,
};
use crate::domain::ledger::{
    DEFAULT_PAGE_SIZE, Entity, ErrorKind, LedgerError, RentalLedger, ReturnReceipt, ReturnRequest,
};
use crate::domain::models::{
    NewPowerBank, NewStation, NewUser, Payment, PaymentId, PaymentStatus, PowerBank,
    PowerBankFilter, PowerBankId, PowerBankStatus, PowerBankUpdate, Rental, RentalId,
    RentalStatus, Station, StationId, StationUpdate, TimestampMs, User, UserId, UserProfile,
    UserUpdate,
};
use crate::domain::rental_state::Clock;

pub const USER_ID_HEADER: &str = "X-User-Id";

pub type ApiLedger = RentalLedger<SqliteRentalService, SystemClock>;

#[derive(Clone)]
pub struct ApiState {
    pub service: SqliteRentalService,
    pub ledger: ApiLedger,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: &'a str,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            kind,
            message: message.to_string(),
        }
    }

    fn unauthenticated(message: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }

    fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidInput.as_str(),
            message,
        )
    }

    fn admin_required(user_id: UserId) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            ErrorKind::Forbidden.as_str(),
            format!("user {user_id} is not an administrator"),
        )
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(ErrorBody {
            error: &self.message,
            kind: self.kind,
        })
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Unavailable
        | ErrorKind::NotActive
        | ErrorKind::InsufficientFunds
        | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        let kind = error.kind();
        if kind == ErrorKind::Internal {
            tracing::error!(error = %error, "ledger storage failure");
        } else {
            tracing::warn!(error = %error, kind = kind.as_str(), "request rejected");
        }
        Self::new(status_for(kind), kind.as_str(), error)
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Rejected(error) => error.into(),
            other @ (ServiceError::DbLockPoisoned | ServiceError::Database(_)) => {
                tracing::error!(error = %other, "directory storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Internal.as_str(),
                    other,
                )
            }
        }
    }
}

/// Caller identity taken from the `X-User-Id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(user_id_from_headers(req))
    }
}

fn user_id_from_headers(req: &HttpRequest) -> Result<AuthenticatedUser, ApiError> {
    let raw = req
        .headers()
        .get(USER_ID_HEADER)
        .ok_or_else(|| ApiError::unauthenticated(format!("{USER_ID_HEADER} header is required")))?
        .to_str()
        .map_err(|_| ApiError::unauthenticated(format!("{USER_ID_HEADER} header is not text")))?;

    match raw.trim().parse::<UserId>() {
        Ok(user_id) if user_id > 0 => Ok(AuthenticatedUser(user_id)),
        _ => Err(ApiError::unauthenticated(format!(
            "{USER_ID_HEADER} must be a positive integer"
        ))),
    }
}

fn caller_is_admin(state: &ApiState, caller: AuthenticatedUser) -> Result<bool, ApiError> {
    Ok(state
        .service
        .get_user(caller.0)?
        .is_some_and(|user| user.is_admin))
}

fn require_admin(state: &ApiState, caller: AuthenticatedUser) -> Result<(), ApiError> {
    if caller_is_admin(state, caller)? {
        Ok(())
    } else {
        Err(ApiError::admin_required(caller.0))
    }
}

fn now() -> TimestampMs {
    SystemClock.now()
}

#[derive(Debug, Serialize, PartialEq)]
pub struct UserResponse {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub balance_cents: i64,
    pub is_admin: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            balance_cents: user.balance_cents,
            is_admin: user.is_admin,
            first_name: user.profile.first_name,
            last_name: user.profile.last_name,
            phone_number: user.profile.phone_number,
            address: user.profile.address,
            created_at: user.created_at.to_iso8601(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StationResponse {
    pub id: StationId,
    pub name: String,
    pub location: String,
    pub capacity: u32,
    pub available_count: u32,
    pub created_at: String,
}

impl From<Station> for StationResponse {
    fn from(station: Station) -> Self {
        Self {
            id: station.id,
            name: station.name,
            location: station.location,
            capacity: station.capacity,
            available_count: station.available_count,
            created_at: station.created_at.to_iso8601(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PowerBankResponse {
    pub id: PowerBankId,
    pub station_id: StationId,
    pub serial_number: String,
    pub capacity_mah: Option<u32>,
    pub current_charge_mah: Option<u32>,
    pub status: PowerBankStatus,
    pub created_at: String,
}

impl From<PowerBank> for PowerBankResponse {
    fn from(power_bank: PowerBank) -> Self {
        Self {
            id: power_bank.id,
            station_id: power_bank.station_id,
            serial_number: power_bank.serial_number,
            capacity_mah: power_bank.capacity_mah,
            current_charge_mah: power_bank.current_charge_mah,
            status: power_bank.status,
            created_at: power_bank.created_at.to_iso8601(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RentalResponse {
    pub id: RentalId,
    pub user_id: UserId,
    pub power_bank_id: PowerBankId,
    pub start_station_id: StationId,
    pub return_station_id: Option<StationId>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_ms: Option<i64>,
    pub status: RentalStatus,
}

impl From<Rental> for RentalResponse {
    fn from(rental: Rental) -> Self {
        Self {
            id: rental.id,
            user_id: rental.user_id,
            power_bank_id: rental.power_bank_id,
            start_station_id: rental.start_station_id,
            return_station_id: rental.return_station_id,
            start_time: rental.started_at.to_iso8601(),
            end_time: rental.ended_at.map(TimestampMs::to_iso8601),
            duration_ms: rental.duration_ms(),
            status: rental.status,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PaymentResponse {
    pub id: PaymentId,
    pub rental_id: RentalId,
    pub user_id: UserId,
    pub amount_cents: i64,
    pub duration_seconds: i64,
    pub reference: String,
    pub status: PaymentStatus,
    pub created_at: String,
    pub settled_at: Option<String>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            rental_id: payment.rental_id,
            user_id: payment.user_id,
            amount_cents: payment.amount_cents,
            duration_seconds: payment.duration_seconds,
            reference: payment.reference,
            status: payment.status,
            created_at: payment.created_at.to_iso8601(),
            settled_at: payment.settled_at.map(TimestampMs::to_iso8601),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ReturnResponse {
    pub rental: RentalResponse,
    pub payment: Option<PaymentResponse>,
}

impl From<ReturnReceipt> for ReturnResponse {
    fn from(receipt: ReturnReceipt) -> Self {
        Self {
            rental: receipt.rental.into(),
            payment: receipt.payment.map(PaymentResponse::from),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiagnosticsCounts {
    pub users: i64,
    pub stations: i64,
    pub power_banks: i64,
    pub rentals: i64,
    pub active_rentals: i64,
    pub payments: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StationDriftResponse {
    pub station_id: StationId,
    pub stored_available_count: i64,
    pub derived_available_count: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiagnosticsDbResponse {
    pub schema_version: u32,
    pub counts: DiagnosticsCounts,
    pub station_count_drift: Vec<StationDriftResponse>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub initial_balance_cents: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateStationRequest {
    pub name: String,
    pub location: String,
    pub capacity: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateStationRequest {
    pub name: Option<String>,
    pub location: Option<String>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePowerBankRequest {
    pub station_id: StationId,
    pub serial_number: String,
    pub capacity_mah: Option<u32>,
    pub current_charge_mah: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePowerBankRequest {
    #[serde(alias = "capacity")]
    pub capacity_mah: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub maintenance: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartRentalRequest {
    #[serde(alias = "powerbank_id")]
    pub power_bank_id: PowerBankId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReturnRentalRequest {
    pub status: Option<RentalStatus>,
    pub return_station_id: Option<StationId>,
    pub current_charge_mah: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PowerBankListQuery {
    pub station_id: Option<StationId>,
    pub status: Option<PowerBankStatus>,
}

#[derive(Debug, Deserialize)]
pub struct RentalListQuery {
    pub user_id: Option<UserId>,
    pub status: Option<RentalStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let response = ApiError::bad_request(&err).error_response();
        actix_web::error::InternalError::from_response(err, response).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _req| {
        let response = ApiError::bad_request(&err).error_response();
        actix_web::error::InternalError::from_response(err, response).into()
    }))
    .app_data(web::PathConfig::default().error_handler(|err, _req| {
        let response = ApiError::bad_request(&err).error_response();
        actix_web::error::InternalError::from_response(err, response).into()
    }))
    .service(health)
    .service(register_user_endpoint)
    .service(get_me_endpoint)
    .service(update_me_endpoint)
    .service(top_up_endpoint)
    .service(list_stations_endpoint)
    .service(get_station_endpoint)
    .service(create_station_endpoint)
    .service(update_station_endpoint)
    .service(list_power_banks_endpoint)
    .service(get_power_bank_endpoint)
    .service(create_power_bank_endpoint)
    .service(update_power_bank_endpoint)
    .service(set_maintenance_endpoint)
    .service(start_rental_endpoint)
    .service(list_rentals_endpoint)
    .service(get_rental_endpoint)
    .service(patch_rental_endpoint)
    .service(put_return_endpoint)
    .service(post_return_endpoint)
    .service(get_payment_endpoint)
    .service(settle_payment_endpoint)
    .service(get_db_diagnostics_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[post("/users")]
async fn register_user_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<RegisterUserRequest>,
) -> impl Responder {
    let body = body.into_inner();
    let new_user = NewUser {
        username: body.username.trim().to_string(),
        email: body.email.trim().to_string(),
        balance_cents: body.initial_balance_cents,
        is_admin: false,
        profile: UserProfile {
            first_name: trimmed(body.first_name),
            last_name: trimmed(body.last_name),
            phone_number: trimmed(body.phone_number),
            address: trimmed(body.address),
        },
        created_at: now(),
    };

    match state.service.register_user(&new_user) {
        Ok(user) => {
            tracing::info!(user_id = user.id, username = %user.username, "user registered");
            HttpResponse::Created().json(UserResponse::from(user))
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/users/me")]
async fn get_me_endpoint(state: web::Data<ApiState>, caller: AuthenticatedUser) -> impl Responder {
    match state.service.get_user(caller.0) {
        Ok(Some(user)) => HttpResponse::Ok().json(UserResponse::from(user)),
        Ok(None) => not_found_response(Entity::User, caller.0),
        Err(error) => service_error_response(error),
    }
}

#[put("/users/me")]
async fn update_me_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    body: web::Json<UpdateUserRequest>,
) -> impl Responder {
    let body = body.into_inner();
    let update = UserUpdate {
        email: body.email.map(|email| email.trim().to_string()),
        profile: UserProfile {
            first_name: trimmed(body.first_name),
            last_name: trimmed(body.last_name),
            phone_number: trimmed(body.phone_number),
            address: trimmed(body.address),
        },
    };

    match state.service.update_user(caller.0, &update) {
        Ok(user) => {
            tracing::info!(user_id = user.id, "user profile updated");
            HttpResponse::Ok().json(UserResponse::from(user))
        }
        Err(error) => service_error_response(error),
    }
}

#[post("/users/me/balance")]
async fn top_up_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    body: web::Json<TopUpRequest>,
) -> impl Responder {
    match state.service.top_up_balance(caller.0, body.amount_cents) {
        Ok(user) => {
            tracing::info!(
                user_id = user.id,
                amount_cents = body.amount_cents,
                balance_cents = user.balance_cents,
                "balance topped up"
            );
            HttpResponse::Ok().json(UserResponse::from(user))
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/stations")]
async fn list_stations_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.service.list_stations() {
        Ok(stations) => {
            let mapped: Vec<StationResponse> =
                stations.into_iter().map(StationResponse::from).collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/stations/{id}")]
async fn get_station_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<StationId>,
) -> impl Responder {
    let station_id = path.into_inner();
    match state.service.get_station(station_id) {
        Ok(Some(station)) => HttpResponse::Ok().json(StationResponse::from(station)),
        Ok(None) => not_found_response(Entity::Station, station_id),
        Err(error) => service_error_response(error),
    }
}

#[post("/stations")]
async fn create_station_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    body: web::Json<CreateStationRequest>,
) -> impl Responder {
    if let Err(error) = require_admin(&state, caller) {
        return error.error_response();
    }

    let body = body.into_inner();
    let new_station = NewStation {
        name: body.name.trim().to_string(),
        location: body.location.trim().to_string(),
        capacity: body.capacity,
        created_at: now(),
    };

    match state.service.create_station(&new_station) {
        Ok(station) => {
            tracing::info!(station_id = station.id, capacity = station.capacity, "station created");
            HttpResponse::Created().json(StationResponse::from(station))
        }
        Err(error) => service_error_response(error),
    }
}

#[put("/stations/{id}")]
async fn update_station_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<StationId>,
    body: web::Json<UpdateStationRequest>,
) -> impl Responder {
    if let Err(error) = require_admin(&state, caller) {
        return error.error_response();
    }

    let body = body.into_inner();
    let update = StationUpdate {
        name: body.name.map(|name| name.trim().to_string()),
        location: body.location.map(|location| location.trim().to_string()),
        capacity: body.capacity,
    };

    match state.service.update_station(path.into_inner(), &update) {
        Ok(station) => {
            tracing::info!(station_id = station.id, "station updated");
            HttpResponse::Ok().json(StationResponse::from(station))
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/powerbanks")]
async fn list_power_banks_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<PowerBankListQuery>,
) -> impl Responder {
    let filter = PowerBankFilter {
        station_id: query.station_id,
        status: query.status,
    };

    match state.service.list_power_banks(&filter) {
        Ok(power_banks) => {
            let mapped: Vec<PowerBankResponse> =
                power_banks.into_iter().map(PowerBankResponse::from).collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/powerbanks/{id}")]
async fn get_power_bank_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<PowerBankId>,
) -> impl Responder {
    let power_bank_id = path.into_inner();
    match state.service.get_power_bank(power_bank_id) {
        Ok(Some(power_bank)) => HttpResponse::Ok().json(PowerBankResponse::from(power_bank)),
        Ok(None) => not_found_response(Entity::PowerBank, power_bank_id),
        Err(error) => service_error_response(error),
    }
}

#[post("/powerbanks")]
async fn create_power_bank_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    body: web::Json<CreatePowerBankRequest>,
) -> impl Responder {
    if let Err(error) = require_admin(&state, caller) {
        return error.error_response();
    }

    let body = body.into_inner();
    let new_power_bank = NewPowerBank {
        station_id: body.station_id,
        serial_number: body.serial_number.trim().to_string(),
        capacity_mah: body.capacity_mah,
        current_charge_mah: body.current_charge_mah,
        created_at: now(),
    };

    match state.service.create_power_bank(&new_power_bank) {
        Ok(power_bank) => {
            tracing::info!(
                power_bank_id = power_bank.id,
                station_id = power_bank.station_id,
                serial_number = %power_bank.serial_number,
                "power bank registered"
            );
            HttpResponse::Created().json(PowerBankResponse::from(power_bank))
        }
        Err(error) => service_error_response(error),
    }
}

#[patch("/powerbanks/{id}")]
async fn update_power_bank_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<PowerBankId>,
    body: web::Json<UpdatePowerBankRequest>,
) -> impl Responder {
    if let Err(error) = require_admin(&state, caller) {
        return error.error_response();
    }

    let update = PowerBankUpdate {
        capacity_mah: body.capacity_mah,
    };

    match state.service.update_power_bank(path.into_inner(), &update) {
        Ok(power_bank) => HttpResponse::Ok().json(PowerBankResponse::from(power_bank)),
        Err(error) => service_error_response(error),
    }
}

#[patch("/powerbanks/{id}/maintenance")]
async fn set_maintenance_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<PowerBankId>,
    body: web::Json<MaintenanceRequest>,
) -> impl Responder {
    if let Err(error) = require_admin(&state, caller) {
        return error.error_response();
    }

    match state
        .service
        .set_maintenance(path.into_inner(), body.maintenance)
    {
        Ok(power_bank) => HttpResponse::Ok().json(PowerBankResponse::from(power_bank)),
        Err(error) => service_error_response(error),
    }
}

#[post("/rentals")]
async fn start_rental_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    body: web::Json<StartRentalRequest>,
) -> impl Responder {
    match state.ledger.start_rental(caller.0, body.power_bank_id) {
        Ok(rental) => HttpResponse::Created().json(RentalResponse::from(rental)),
        Err(error) => ledger_error_response(error),
    }
}

#[get("/rentals")]
async fn list_rentals_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    query: web::Query<RentalListQuery>,
) -> impl Responder {
    match visible_rentals(&state, caller, &query) {
        Ok(rentals) => {
            let mapped: Vec<RentalResponse> =
                rentals.into_iter().map(RentalResponse::from).collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => error.error_response(),
    }
}

/// Riders see their own rentals; admins may name any user or omit `user_id` for all.
fn visible_rentals(
    state: &ApiState,
    caller: AuthenticatedUser,
    query: &RentalListQuery,
) -> Result<Vec<Rental>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    let rentals = match query.user_id {
        Some(user_id) if user_id == caller.0 => {
            state
                .ledger
                .list_rentals(user_id, query.status, limit, offset)?
        }
        user_id => {
            if caller_is_admin(state, caller)? {
                state
                    .ledger
                    .query_rentals(user_id, query.status, limit, offset)?
            } else if user_id.is_none() {
                state
                    .ledger
                    .list_rentals(caller.0, query.status, limit, offset)?
            } else {
                return Err(ApiError::admin_required(caller.0));
            }
        }
    };

    Ok(rentals)
}

#[get("/rentals/{id}")]
async fn get_rental_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<RentalId>,
) -> impl Responder {
    let rental_id = path.into_inner();
    let rental = match state.ledger.get_rental(rental_id, caller.0) {
        Err(forbidden @ LedgerError::Forbidden { .. }) => match caller_is_admin(&state, caller) {
            Ok(true) => state.ledger.find_rental(rental_id),
            Ok(false) => Err(forbidden),
            Err(error) => return error.error_response(),
        },
        other => other,
    };

    match rental {
        Ok(rental) => HttpResponse::Ok().json(RentalResponse::from(rental)),
        Err(error) => ledger_error_response(error),
    }
}

#[patch("/rentals/{id}")]
async fn patch_rental_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<RentalId>,
    body: web::Bytes,
) -> impl Responder {
    return_rental(&state, caller, path.into_inner(), &body)
}

#[put("/rentals/{id}/return")]
async fn put_return_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<RentalId>,
    body: web::Bytes,
) -> impl Responder {
    return_rental(&state, caller, path.into_inner(), &body)
}

#[post("/rentals/{id}/return")]
async fn post_return_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<RentalId>,
    body: web::Bytes,
) -> impl Responder {
    return_rental(&state, caller, path.into_inner(), &body)
}

/// The return body is optional; an empty body returns to the origin station.
fn return_rental(
    state: &ApiState,
    caller: AuthenticatedUser,
    rental_id: RentalId,
    body: &[u8],
) -> HttpResponse {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ReturnRentalRequest::default()
    } else {
        match serde_json::from_slice::<ReturnRentalRequest>(body) {
            Ok(request) => request,
            Err(error) => return ApiError::bad_request(error).error_response(),
        }
    };

    if request.status == Some(RentalStatus::Active) {
        return ApiError::bad_request("a rental can only move to completed").error_response();
    }

    let result = state.ledger.return_rental(&ReturnRequest {
        rental_id,
        user_id: caller.0,
        return_station_id: request.return_station_id,
        current_charge_mah: request.current_charge_mah,
    });

    match result {
        Ok(receipt) => HttpResponse::Ok().json(ReturnResponse::from(receipt)),
        Err(error) => ledger_error_response(error),
    }
}

#[get("/payments/{id}")]
async fn get_payment_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<PaymentId>,
) -> impl Responder {
    let payment_id = path.into_inner();
    let payment = match state.service.get_payment(payment_id) {
        Ok(Some(payment)) => payment,
        Ok(None) => return not_found_response(Entity::Payment, payment_id),
        Err(error) => return service_error_response(error),
    };

    if payment.user_id != caller.0 {
        match caller_is_admin(&state, caller) {
            Ok(true) => {}
            Ok(false) => {
                return ledger_error_response(LedgerError::Forbidden {
                    entity: Entity::Payment,
                    id: payment_id,
                    user_id: caller.0,
                });
            }
            Err(error) => return error.error_response(),
        }
    }

    HttpResponse::Ok().json(PaymentResponse::from(payment))
}

#[post("/payments/{id}/pay")]
async fn settle_payment_endpoint(
    state: web::Data<ApiState>,
    caller: AuthenticatedUser,
    path: web::Path<PaymentId>,
) -> impl Responder {
    match state.ledger.settle_payment(path.into_inner(), caller.0) {
        Ok(payment) => HttpResponse::Ok().json(PaymentResponse::from(payment)),
        Err(error) => ledger_error_response(error),
    }
}

#[get("/diagnostics/db")]
async fn get_db_diagnostics_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let schema_version = match state.service.get_schema_version() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let counts = match state.service.count_rows() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let drift = match state.service.find_station_count_drift() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };

    if !drift.is_empty() {
        tracing::warn!(stations = drift.len(), "station availability counters drifted");
    }

    HttpResponse::Ok().json(DiagnosticsDbResponse {
        schema_version,
        counts: DiagnosticsCounts {
            users: counts.users,
            stations: counts.stations,
            power_banks: counts.power_banks,
            rentals: counts.rentals,
            active_rentals: counts.active_rentals,
            payments: counts.payments,
        },
        station_count_drift: drift
            .into_iter()
            .map(|entry| StationDriftResponse {
                station_id: entry.station_id,
                stored_available_count: entry.stored,
                derived_available_count: entry.derived,
            })
            .collect(),
    })
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string())
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    ApiError::from(error).error_response()
}

fn ledger_error_response(error: LedgerError) -> HttpResponse {
    ApiError::from(error).error_response()
}

fn not_found_response(entity: Entity, id: i64) -> HttpResponse {
    ledger_error_response(LedgerError::NotFound { entity, id })
}

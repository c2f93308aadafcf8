use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State as AxumState,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parlor_execution::{
    open_account, outcome::live_multiplier_x100, profit_log_len, read_balance, read_profit_log, read_round,
    read_treasury, BetError, BetRequest, Memory, Notice, Receipt, Registrar, StoreError,
    SystemClock,
};
use parlor_types::{
    Choice, GameKind, Outcome, Phase, PhasePlan, ProfitLogEntry, RoundRecord,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const RECENT_PROFIT_ENTRIES: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Memory>,
    pub registrar: Arc<Registrar<Memory, SystemClock>>,
    pub broadcaster: broadcast::Sender<OutboundEvent>,
    pub starting_balance: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rounds/:game", get(get_round))
        .route("/accounts", post(create_account))
        .route("/accounts/:participant", get(get_account))
        .route("/bets", post(place_bet))
        .route("/treasury", get(get_treasury))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "game", rename_all = "kebab-case")]
pub enum OutcomeView {
    ColorWheel { segment: u8 },
    Dice { face: u8 },
    Crash { crash_point_x100: u32 },
    Ladder { paths: Vec<u8>, prize_slot: u8, winning_lane: Option<u8> },
    Race { winner: u8 },
}

impl From<&Outcome> for OutcomeView {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::ColorWheel { segment } => OutcomeView::ColorWheel { segment: *segment },
            Outcome::Dice { face } => OutcomeView::Dice { face: *face },
            Outcome::Crash { crash_point_x100 } => OutcomeView::Crash {
                crash_point_x100: *crash_point_x100,
            },
            Outcome::Ladder { paths, prize_slot } => OutcomeView::Ladder {
                paths: paths.to_vec(),
                prize_slot: *prize_slot,
                winning_lane: outcome.ladder_winning_lane(),
            },
            Outcome::Race { winner } => OutcomeView::Race { winner: *winner },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BetView {
    pub participant: String,
    pub slot: u8,
    pub nickname: String,
    pub amount: u64,
    pub choice: Choice,
}

#[derive(Clone, Debug, Serialize)]
pub struct WinnerView {
    pub participant: String,
    pub nickname: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundView {
    pub game: GameKind,
    pub round_id: u64,
    pub status: Phase,
    pub phase_started_at_ms: u64,
    pub phase_deadline_ms: u64,
    pub total_wagered: u64,
    pub carry_over: u64,
    pub bets: Vec<BetView>,
    /// Hidden while a crash round is still climbing.
    pub outcome: Option<OutcomeView>,
    pub last_round_winners: Vec<WinnerView>,
}

impl From<&RoundRecord> for RoundView {
    fn from(record: &RoundRecord) -> Self {
        let concealed =
            record.game.phase_plan() == PhasePlan::Continuous && record.status == Phase::Resolving;
        Self {
            game: record.game,
            round_id: record.round_id,
            status: record.status,
            phase_started_at_ms: record.phase_started_at_ms,
            phase_deadline_ms: record.phase_deadline_ms,
            total_wagered: record.total_wagered(),
            carry_over: record.carry_over,
            bets: record
                .bets
                .iter()
                .map(|(key, bet)| BetView {
                    participant: key.participant.clone(),
                    slot: key.slot,
                    nickname: bet.nickname.clone(),
                    amount: bet.amount,
                    choice: bet.choice,
                })
                .collect(),
            outcome: record
                .outcome
                .as_ref()
                .filter(|_| !concealed)
                .map(OutcomeView::from),
            last_round_winners: record
                .last_round_winners
                .iter()
                .map(|winner| WinnerView {
                    participant: winner.participant.clone(),
                    nickname: winner.nickname.clone(),
                    amount: winner.amount,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundResponse {
    #[serde(flatten)]
    pub round: RoundView,
    /// Current crash multiplier while a crash round is resolving.
    pub live_multiplier_x100: Option<u32>,
    pub server_time_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProfitView {
    pub round_ref: String,
    pub game: GameKind,
    pub amount: i64,
    pub fee_rate: f64,
    pub total_wagered: u64,
    pub total_paid: u64,
    pub timestamp_ms: u64,
}

impl From<&ProfitLogEntry> for ProfitView {
    fn from(entry: &ProfitLogEntry) -> Self {
        Self {
            round_ref: entry.round_ref(),
            game: entry.game,
            amount: entry.amount,
            fee_rate: entry.fee_rate(),
            total_wagered: entry.total_wagered,
            total_paid: entry.total_paid,
            timestamp_ms: entry.timestamp_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TreasuryResponse {
    pub balance: u64,
    pub recent: Vec<ProfitView>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AccountResponse {
    pub participant: String,
    pub balance: u64,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct AccountRequest {
    pub participant: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReceiptView {
    pub round_id: u64,
    pub participant: String,
    pub slot: u8,
    pub stake: u64,
    pub balance: u64,
}

impl From<Receipt> for ReceiptView {
    fn from(receipt: Receipt) -> Self {
        Self {
            round_id: receipt.round_id,
            participant: receipt.key.participant,
            slot: receipt.key.slot,
            stake: receipt.stake,
            balance: receipt.balance,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Round { payload: RoundView },
    Payout {
        participant: String,
        nickname: String,
        game: GameKind,
        round_id: u64,
        amount: u64,
    },
}

impl From<Notice> for OutboundEvent {
    fn from(notice: Notice) -> Self {
        OutboundEvent::Payout {
            participant: notice.participant,
            nickname: notice.nickname,
            game: notice.game,
            round_id: notice.round_id,
            amount: notice.amount,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Bet {
        request_id: String,
        #[serde(flatten)]
        bet: BetRequest,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundResponse {
    Ack { request_id: String, receipt: ReceiptView },
    Error { request_id: String, code: &'static str, message: String },
}

#[derive(Debug)]
pub enum ApiError {
    UnknownGame(String),
    NotFound(&'static str),
    InvalidRequest(String),
    Bet(BetError),
    Store(StoreError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::UnknownGame(_) => (StatusCode::NOT_FOUND, "UNKNOWN_GAME"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::Bet(err) => bet_error_parts(err),
            ApiError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::UnknownGame(game) => format!("unknown game: {game}"),
            ApiError::NotFound(what) => format!("{what} not found"),
            ApiError::InvalidRequest(message) => message.clone(),
            ApiError::Bet(err) => err.to_string(),
            ApiError::Store(err) => err.to_string(),
        }
    }
}

fn bet_error_parts(err: &BetError) -> (StatusCode, &'static str) {
    match err {
        BetError::BettingClosed => (StatusCode::CONFLICT, "BETTING_CLOSED"),
        BetError::RoundMissing(_) => (StatusCode::CONFLICT, "ROUND_MISSING"),
        BetError::ChoiceConflict => (StatusCode::CONFLICT, "CHOICE_CONFLICT"),
        BetError::TooManyBets => (StatusCode::CONFLICT, "ROUND_FULL"),
        BetError::InsufficientBalance { .. } => (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_BALANCE"),
        BetError::UnknownAccount => (StatusCode::NOT_FOUND, "UNKNOWN_ACCOUNT"),
        BetError::Rejected(_) => (StatusCode::CONFLICT, "BET_REJECTED_FUNDS_RETURNED"),
        BetError::RefundFailed { .. } | BetError::Store(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
        BetError::ZeroAmount
        | BetError::OutOfLimits { .. }
        | BetError::InvalidParticipant
        | BetError::InvalidNickname
        | BetError::WrongGame { .. }
        | BetError::InvalidChoice(_)
        | BetError::InvalidSlot { .. } => (StatusCode::BAD_REQUEST, "INVALID_BET"),
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<BetError> for ApiError {
    fn from(err: BetError) -> Self {
        ApiError::Bet(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = ErrorBody {
            code,
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

fn now_ms() -> u64 {
    use parlor_execution::Clock;
    SystemClock.now_ms()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_round(
    AxumState(state): AxumState<AppState>,
    Path(game): Path<String>,
) -> Result<Json<RoundResponse>, ApiError> {
    let game = game
        .parse::<GameKind>()
        .map_err(|_| ApiError::UnknownGame(game.clone()))?;
    let (_, record) = read_round(&*state.store, game)?.ok_or(ApiError::NotFound("round"))?;
    let now = now_ms();
    let live_multiplier_x100 = (game.phase_plan() == PhasePlan::Continuous
        && record.status == Phase::Resolving)
        .then(|| live_multiplier_x100(now.saturating_sub(record.phase_started_at_ms)));
    Ok(Json(RoundResponse {
        round: RoundView::from(&record),
        live_multiplier_x100,
        server_time_ms: now,
    }))
}

async fn create_account(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<AccountRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    let participant = request.participant.trim().to_string();
    if participant.is_empty() || participant.len() > parlor_types::round::MAX_PARTICIPANT_ID_LENGTH {
        return Err(ApiError::InvalidRequest("invalid participant id".to_string()));
    }
    let created = open_account(&*state.store, &participant, state.starting_balance)?;
    let balance = read_balance(&*state.store, &participant)?.ok_or(ApiError::NotFound("account"))?;
    Ok(Json(AccountResponse {
        participant,
        balance,
        created,
    }))
}

async fn get_account(
    AxumState(state): AxumState<AppState>,
    Path(participant): Path<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    let balance = read_balance(&*state.store, &participant)?.ok_or(ApiError::NotFound("account"))?;
    Ok(Json(AccountResponse {
        participant,
        balance,
        created: false,
    }))
}

async fn place_bet(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<BetRequest>,
) -> Result<Json<ReceiptView>, ApiError> {
    let receipt = state.registrar.place_bet(request)?;
    Ok(Json(receipt.into()))
}

async fn get_treasury(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<TreasuryResponse>, ApiError> {
    let treasury = read_treasury(&*state.store)?;
    let from = profit_log_len(&*state.store)?.saturating_sub(RECENT_PROFIT_ENTRIES as u64);
    let entries = read_profit_log(&*state.store, from, RECENT_PROFIT_ENTRIES)?;
    Ok(Json(TreasuryResponse {
        balance: treasury.balance,
        recent: entries.iter().rev().map(ProfitView::from).collect(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    AxumState(state): AxumState<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut broadcast_rx = state.broadcaster.subscribe();

    // Start every client from the current rounds.
    for game in GameKind::ALL {
        if let Ok(Some((_, record))) = read_round(&*state.store, game) {
            send_response(&tx, &OutboundEvent::Round {
                payload: RoundView::from(&record),
            });
        }
    }

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let broadcast_task = {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => send_response(&tx, &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws client lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(InboundMessage::Bet { request_id, bet }) => {
                    let response = match state.registrar.place_bet(bet) {
                        Ok(receipt) => OutboundResponse::Ack {
                            request_id,
                            receipt: receipt.into(),
                        },
                        Err(err) => {
                            let (_, code) = bet_error_parts(&err);
                            OutboundResponse::Error {
                                request_id,
                                code,
                                message: err.to_string(),
                            }
                        }
                    };
                    send_response(&tx, &response);
                }
                Err(err) => {
                    warn!(?err, "invalid inbound message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    write_task.abort();
    broadcast_task.abort();
}

fn send_response<T: Serialize>(tx: &mpsc::UnboundedSender<Message>, value: &T) {
    if let Ok(payload) = serde_json::to_string(value) {
        let _ = tx.send(Message::Text(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_execution::{Mutation, ReadSet, Store};
    use parlor_types::{Bet, BetKey, Color, Key, Value};

    fn state() -> AppState {
        let store = Arc::new(Memory::new());
        let registrar = Arc::new(Registrar::new(store.clone(), SystemClock));
        let (broadcaster, _) = broadcast::channel(16);
        AppState {
            store,
            registrar,
            broadcaster,
            starting_balance: 1_000,
        }
    }

    fn open_round(state: &AppState, game: GameKind) {
        let record = RoundRecord::fresh(game, 1, now_ms(), 60_000);
        state
            .store
            .commit(
                &ReadSet::new(),
                &[Mutation::Put(Key::Round(game), Value::Round(record))],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn account_creation_is_idempotent() {
        let state = state();
        let request = || AccountRequest {
            participant: "alice".to_string(),
        };
        let Json(first) = create_account(AxumState(state.clone()), Json(request()))
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.balance, 1_000);

        let Json(second) = create_account(AxumState(state.clone()), Json(request()))
            .await
            .unwrap();
        assert!(!second.created);

        assert!(matches!(
            get_account(AxumState(state), Path("bob".to_string())).await,
            Err(ApiError::NotFound("account"))
        ));
    }

    #[tokio::test]
    async fn bet_then_round_view_shows_it() {
        let state = state();
        open_round(&state, GameKind::ColorWheel);
        let Json(account) = create_account(
            AxumState(state.clone()),
            Json(AccountRequest {
                participant: "alice".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(account.created);

        let request: BetRequest = serde_json::from_value(serde_json::json!({
            "game": "color-wheel",
            "participant": "alice",
            "nickname": "Alice",
            "amount": 100,
            "choice": { "game": "color-wheel", "color": "red" }
        }))
        .unwrap();
        let Json(receipt) = place_bet(AxumState(state.clone()), Json(request)).await.unwrap();
        assert_eq!(receipt.balance, 900);

        let Json(round) = get_round(AxumState(state), Path("color-wheel".to_string()))
            .await
            .unwrap();
        assert_eq!(round.round.bets.len(), 1);
        assert_eq!(round.round.total_wagered, 100);
        assert!(round.live_multiplier_x100.is_none());
    }

    #[tokio::test]
    async fn unknown_game_and_missing_round() {
        let state = state();
        assert!(matches!(
            get_round(AxumState(state.clone()), Path("poker".to_string())).await,
            Err(ApiError::UnknownGame(_))
        ));
        assert!(matches!(
            get_round(AxumState(state), Path("dice".to_string())).await,
            Err(ApiError::NotFound("round"))
        ));
    }

    #[tokio::test]
    async fn treasury_lists_most_recent_entries_first() {
        let state = state();
        let mutations: Vec<Mutation> = (1..=60u64)
            .map(|round_id| {
                Mutation::AppendProfit(ProfitLogEntry {
                    game: GameKind::Race,
                    round_id,
                    amount: 10,
                    fee_bps: 1_000,
                    total_wagered: 100,
                    total_paid: 90,
                    timestamp_ms: round_id,
                })
            })
            .chain(std::iter::once(Mutation::CreditTreasury(600)))
            .collect();
        state.store.commit(&ReadSet::new(), &mutations).unwrap();

        let Json(treasury) = get_treasury(AxumState(state)).await.unwrap();
        assert_eq!(treasury.balance, 600);
        assert_eq!(treasury.recent.len(), RECENT_PROFIT_ENTRIES);
        assert_eq!(treasury.recent[0].round_ref, "race-60");
        assert_eq!(treasury.recent[RECENT_PROFIT_ENTRIES - 1].round_ref, "race-11");
    }

    #[test]
    fn bet_errors_map_to_codes() {
        let err = ApiError::Bet(BetError::BettingClosed);
        assert_eq!(err.parts(), (StatusCode::CONFLICT, "BETTING_CLOSED"));
        let err = ApiError::Bet(BetError::InsufficientBalance {
            available: 1,
            requested: 2,
        });
        assert_eq!(err.parts().1, "INSUFFICIENT_BALANCE");
    }

    #[test]
    fn resolving_crash_round_hides_crash_point() {
        let mut record = RoundRecord::fresh(GameKind::Crash, 3, 0, 10_000);
        record.status = Phase::Resolving;
        record.outcome = Some(Outcome::Crash {
            crash_point_x100: 420,
        });
        assert!(RoundView::from(&record).outcome.is_none());

        record.status = Phase::Result;
        assert!(RoundView::from(&record).outcome.is_some());
    }

    #[test]
    fn round_view_serializes_bets() {
        let mut record = RoundRecord::fresh(GameKind::ColorWheel, 1, 0, 10_000);
        record.bets.insert(
            BetKey::new("alice", 0),
            Bet {
                amount: 5,
                choice: Choice::ColorWheel { color: Color::Green },
                nickname: "Al".to_string(),
                submitted_at_ms: 1,
            },
        );
        let json = serde_json::to_value(OutboundEvent::Round {
            payload: RoundView::from(&record),
        })
        .unwrap();
        assert_eq!(json["type"], "round");
        assert_eq!(json["payload"]["bets"][0]["choice"]["color"], "green");
        assert_eq!(json["payload"]["status"], "betting");
    }

    #[test]
    fn inbound_bet_parses() {
        let text = r#"{"type":"bet","request_id":"r1","game":"race","participant":"p","nickname":"P","amount":10,"choice":{"game":"race","runner":3}}"#;
        let InboundMessage::Bet { request_id, bet } = serde_json::from_str(text).unwrap();
        assert_eq!(request_id, "r1");
        assert_eq!(bet.slot, 0);
        assert_eq!(bet.choice, Choice::Race { runner: 3 });
    }
}

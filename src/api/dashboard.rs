//! Embedded dashboard page
//!
//! Single static HTML page polling the public endpoints. Unlocking with the
//! bearer token enables the full instance table and dismiss actions.

/// HTML dashboard page
pub const DASHBOARD_HTML: &str = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>convopool</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #0a0a0a;
            color: #e0e0e0;
            min-height: 100vh;
            padding: 2rem;
        }
        .header {
            text-align: center;
            margin-bottom: 2rem;
            border-bottom: 1px solid #333;
            padding-bottom: 1rem;
        }
        .header h1 { color: #7aa2ff; font-size: 2rem; margin-bottom: 0.5rem; }
        .header p { color: #888; }
        .grid {
            display: grid;
            grid-template-columns: repeat(auto-fit, minmax(160px, 1fr));
            gap: 1rem;
            max-width: 900px;
            margin: 0 auto 2rem auto;
        }
        .card {
            background: #1a1a1a;
            border-radius: 12px;
            padding: 1.25rem;
            border: 1px solid #333;
            text-align: center;
        }
        .card h2 {
            color: #888;
            font-size: 0.8rem;
            text-transform: uppercase;
            letter-spacing: 1px;
            margin-bottom: 0.5rem;
        }
        .card .value { font-size: 2rem; font-weight: bold; }
        .value.idle { color: #4cd97b; }
        .value.starting { color: #ffaa00; }
        .value.claimed { color: #7aa2ff; }
        .value.crashed { color: #ff4444; }
        table {
            width: 100%;
            max-width: 900px;
            margin: 0 auto;
            border-collapse: collapse;
        }
        th, td {
            text-align: left;
            padding: 0.5rem 0.75rem;
            border-bottom: 1px solid #222;
            font-size: 0.875rem;
        }
        th { color: #888; text-transform: uppercase; font-size: 0.75rem; letter-spacing: 1px; }
        .state-idle { color: #4cd97b; }
        .state-starting { color: #ffaa00; }
        .state-claimed { color: #7aa2ff; }
        .state-crashed { color: #ff4444; }
        .actions { text-align: center; margin: 1.5rem 0; }
        button {
            background: #222;
            color: #e0e0e0;
            border: 1px solid #444;
            border-radius: 8px;
            padding: 0.4rem 0.9rem;
            cursor: pointer;
        }
        button:hover { border-color: #7aa2ff; }
        .dismiss { color: #ff4444; }
        .refresh-note {
            text-align: center;
            color: #666;
            margin-top: 2rem;
            font-size: 0.875rem;
        }
    </style>
</head>
<body>
    <div class="header">
        <h1>convopool</h1>
        <p>Warm agent instance pool</p>
    </div>

    <div class="grid">
        <div class="card"><h2>Starting</h2><div class="value starting" id="count-starting">-</div></div>
        <div class="card"><h2>Idle</h2><div class="value idle" id="count-idle">-</div></div>
        <div class="card"><h2>Claimed</h2><div class="value claimed" id="count-claimed">-</div></div>
        <div class="card"><h2>Crashed</h2><div class="value crashed" id="count-crashed">-</div></div>
    </div>

    <div class="actions">
        <button id="unlock" onclick="unlock()">Unlock admin view</button>
    </div>

    <table id="agents-table">
        <thead>
            <tr><th>Instance</th><th>Agent</th><th>State</th><th>Conversation</th><th></th></tr>
        </thead>
        <tbody id="agents-body"></tbody>
    </table>

    <p class="refresh-note">Auto-refreshes every 2 seconds</p>

    <script>
        let token = null;

        function unlock() {
            token = prompt('Control plane token');
            fetchData();
        }

        function authHeaders() {
            return token ? { 'Authorization': 'Bearer ' + token } : {};
        }

        async function dismiss(id) {
            if (!token) { unlock(); if (!token) return; }
            await fetch('/pool/crashed/' + id, { method: 'DELETE', headers: authHeaders() });
            fetchData();
        }

        function row(inst) {
            const dismissBtn = inst.state === 'crashed'
                ? `<button class="dismiss" onclick="dismiss('${inst.id || inst.instanceId}')">Dismiss</button>`
                : '';
            return `<tr>
                <td>${inst.id || inst.instanceId}</td>
                <td>${inst.agentName || '-'}</td>
                <td class="state-${inst.state || 'claimed'}">${inst.state || 'claimed'}</td>
                <td>${inst.conversationId || '-'}</td>
                <td>${dismissBtn}</td>
            </tr>`;
        }

        async function fetchData() {
            try {
                const countsRes = await fetch('/pool/counts');
                const counts = await countsRes.json();
                for (const key of ['starting', 'idle', 'claimed', 'crashed']) {
                    document.getElementById('count-' + key).textContent = counts[key];
                }

                // Full instance table with the token, claimed agents without
                let instances;
                if (token) {
                    const res = await fetch('/pool/status', { headers: authHeaders() });
                    if (res.ok) {
                        instances = (await res.json()).instances;
                    }
                }
                if (!instances) {
                    const res = await fetch('/pool/agents');
                    instances = await res.json();
                }
                document.getElementById('agents-body').innerHTML = instances.map(row).join('');
            } catch (err) {
                console.error('Error fetching data:', err);
            }
        }

        fetchData();
        setInterval(fetchData, 2000);
    </script>
</body>
</html>
"#;
